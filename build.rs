use std::fs;

fn reqwest_version() -> Option<String> {
    let cargo_lock = fs::read_to_string("Cargo.lock").ok()?;
    let lockfile: toml::Value = toml::from_str(&cargo_lock).ok()?;
    lockfile["package"]
        .as_array()?
        .iter()
        .find(|pkg| pkg["name"].as_str() == Some("reqwest"))
        .and_then(|pkg| pkg["version"].as_str())
        .map(ToString::to_string)
}

fn main() {
    // The ACME User-Agent carries the HTTP library version. A fresh checkout has no
    // lockfile during the very first build, so fall back to a placeholder.
    let version = reqwest_version().unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=REQWEST_VERSION={version}");
    println!("cargo:rerun-if-changed=Cargo.lock");
}
