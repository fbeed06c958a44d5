/// `u64` written as a decimal string. Reads either form.
pub mod quoted_u64 {
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum QuotedOrPlain {
        Quoted(String),
        Plain(u64),
    }

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match QuotedOrPlain::deserialize(deserializer)? {
            QuotedOrPlain::Quoted(text) => text
                .parse()
                .map_err(|err| D::Error::custom(format!("invalid u64 {text:?}: {err}"))),
            QuotedOrPlain::Plain(value) => Ok(value),
        }
    }
}
