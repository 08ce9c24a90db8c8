pub(crate) mod serde_helper {
    use core::fmt;
    use serde::de::{Error, Visitor};
    use serde::{Deserialize, Deserializer};
    use std::ops::Deref;

    /// RFC 3339 timestamps that ACME servers may omit.
    pub(crate) mod optional_offset_date_time {
        use serde::{Deserializer, Serializer};
        use time::OffsetDateTime;
        use time::serde::rfc3339;

        pub fn serialize<S>(input: &Option<OffsetDateTime>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match input {
                Some(time) => rfc3339::serialize(time, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<OffsetDateTime>, D::Error>
        where
            D: Deserializer<'de>,
        {
            rfc3339::deserialize(deserializer).map(Some)
        }
    }

    /// Raw response body, used for the one ACME resource that is not JSON (the PEM chain).
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct PassthroughBytes {
        inner: Vec<u8>,
    }

    impl PassthroughBytes {
        pub fn into_inner(self) -> Vec<u8> {
            self.inner
        }
    }

    struct PassthroughBytesVisitor;

    impl<'de> Visitor<'de> for PassthroughBytesVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a byte array")
        }

        fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
        where
            E: Error,
        {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E>
        where
            E: Error,
        {
            Ok(v)
        }
    }

    impl<'de> Deserialize<'de> for PassthroughBytes {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            let inner = deserializer.deserialize_byte_buf(PassthroughBytesVisitor)?;
            Ok(Self { inner })
        }
    }

    impl Deref for PassthroughBytes {
        type Target = [u8];

        fn deref(&self) -> &Self::Target {
            &self.inner
        }
    }
}
