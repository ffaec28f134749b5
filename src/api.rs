
pub mod artifact;
pub mod client;
pub mod error;
pub mod experiment;
pub mod id;
pub mod model;
pub mod notebook;
pub mod run;
pub mod search;

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum IntOrStr {
    Int(i64),
    Str(String),
}

impl IntOrStr {
    fn into_i64<E: serde::de::Error>(self) -> Result<i64, E> {
        match self {
            IntOrStr::Int(int) => Ok(int),
            IntOrStr::Str(s) => s.parse().map_err(E::custom),
        }
    }
}

// serialize i64 as str, accept both str and number
mod str_int {
    use serde::de::{Deserialize, Deserializer};
    use serde::ser::{Serialize, Serializer};

    use super::IntOrStr;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<i64, D::Error>
    where
        D: Deserializer<'de>
    {
        IntOrStr::deserialize(deserializer)?.into_i64()
    }

    pub fn serialize<S>(int: &i64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s: String = format!("{}", int);
        s.serialize(serializer)
    }
}
// serialize Option<i64> as Option<str>, accept both str and number
mod opt_str_int {
    use serde::de::{Deserialize, Deserializer};
    use serde::ser::{Serialize, Serializer};

    use super::IntOrStr;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
    where
        D: Deserializer<'de>
    {
        match Option::<IntOrStr>::deserialize(deserializer)? {
            Some(value) => Ok(Some(value.into_i64()?)),
            None => Ok(None),
        }
    }

    pub fn serialize<S>(int: &Option<i64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = int.map(|int| format!("{}", int));
        s.serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Times {
        #[serde(with = "super::str_int")]
        start: i64,
        #[serde(default, with = "super::opt_str_int")]
        end: Option<i64>,
    }

    #[test]
    fn accepts_numbers_and_strings() {
        let parsed: Times = serde_json::from_str(r#"{"start": "17", "end": 18}"#).unwrap();
        assert_eq!(parsed.start, 17);
        assert_eq!(parsed.end, Some(18));

        let parsed: Times = serde_json::from_str(r#"{"start": 3}"#).unwrap();
        assert_eq!(parsed.end, None);
        assert_eq!(serde_json::to_string(&parsed).unwrap(), r#"{"start":"3","end":null}"#);
    }
}
