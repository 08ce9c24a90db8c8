use crate::config::{ConfigBackend, Configuration};
use anyhow::{Context, Error};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use toml_edit::DocumentMut;

/// TOML file backend. Saving rewrites the whole document in canonical form.
#[derive(Debug, Clone, Default)]
pub struct TomlConfiguration {
    document: DocumentMut,
}

impl TomlConfiguration {
    fn load_toml(file: &Path) -> Result<Self, Error> {
        let document = std::fs::read_to_string(file)
            .with_context(|| format!("Reading configuration {}", file.display()))?;
        let document = DocumentMut::from_str(&document)
            .with_context(|| format!("Configuration {} is not valid TOML", file.display()))?;
        Ok(Self { document })
    }

    // The file may hold the remote API access token
    fn write_toml(&self, file: &Path) -> Result<(), Error> {
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut handle = options
            .open(file)
            .with_context(|| format!("Opening {} for writing", file.display()))?;
        handle.write_all(self.document.to_string().as_bytes())?;
        Ok(())
    }

    fn into_configuration(self) -> Result<Configuration, Error> {
        Ok(toml_edit::de::from_document(self.document)?)
    }

    fn replace_with(&mut self, config: &Configuration) -> Result<(), Error> {
        // to_document does not prettify, so take the detour over a string
        let pretty_string = toml_edit::ser::to_string_pretty(config)?;
        self.document = DocumentMut::from_str(&pretty_string)?;
        Ok(())
    }
}

impl ConfigBackend for TomlConfiguration {
    fn load<P: AsRef<Path>>(file: P) -> Result<Configuration, Error> {
        Self::load_toml(file.as_ref())?.into_configuration()
    }

    fn save<P: AsRef<Path>>(config: &Configuration, file: P) -> Result<(), Error> {
        let mut toml = TomlConfiguration::default();
        toml.replace_with(config)?;
        toml.write_toml(file.as_ref())
    }
}
