//! Identity of one scaled dataset.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Project, crystal and wavelength names identifying one dataset.
///
/// Persisted as `pname/xname/dname` so it can key a JSON object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatasetKey {
    pub pname: String,
    pub xname: String,
    pub dname: String,
}

impl DatasetKey {
    pub fn new(pname: impl Into<String>, xname: impl Into<String>, dname: impl Into<String>) -> Self {
        Self {
            pname: pname.into(),
            xname: xname.into(),
            dname: dname.into(),
        }
    }
}

impl fmt::Display for DatasetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.pname, self.xname, self.dname)
    }
}

impl FromStr for DatasetKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [pname, xname, dname] if !parts.iter().any(|p| p.is_empty()) => {
                Ok(Self::new(*pname, *xname, *dname))
            }
            _ => Err(Error::InvalidArgument(format!("dataset key {s} is not pname/xname/dname"))),
        }
    }
}

impl TryFrom<String> for DatasetKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DatasetKey> for String {
    fn from(key: DatasetKey) -> Self {
        key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_parse_and_display() {
        let key: DatasetKey = "AUTOMATIC/DEFAULT/NATIVE".parse().unwrap();
        assert_eq!(key, DatasetKey::new("AUTOMATIC", "DEFAULT", "NATIVE"));
        assert_eq!(key.to_string(), "AUTOMATIC/DEFAULT/NATIVE");
        assert!("AUTOMATIC/DEFAULT".parse::<DatasetKey>().is_err());
        assert!("a//b".parse::<DatasetKey>().is_err());
    }

    #[test]
    fn test_usable_as_json_object_key() {
        let mut map = BTreeMap::new();
        map.insert(DatasetKey::new("p", "x", "d"), 1.5);
        let text = serde_json::to_string(&map).unwrap();
        assert_eq!(text, r#"{"p/x/d":1.5}"#);
        let back: BTreeMap<DatasetKey, f64> = serde_json::from_str(&text).unwrap();
        assert_eq!(back, map);
    }
}
