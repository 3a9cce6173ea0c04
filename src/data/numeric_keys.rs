//! Reading back maps keyed by integers.
//!
//! JSON object keys are always strings. serde_json turns them back into
//! integers when it deserializes a map directly, but not when the map
//! sits inside an internally tagged enum, whose content is buffered
//! first. Fields using [`deserialize`] accept either form.

use serde::de::{self, Deserialize, Deserializer, MapAccess, Visitor};
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

/// Deserialize a `BTreeMap` whose keys are integers or decimal strings.
pub fn deserialize<'de, D, K, V>(deserializer: D) -> Result<BTreeMap<K, V>, D::Error>
where
    D: Deserializer<'de>,
    K: TryFrom<u64> + Ord,
    V: Deserialize<'de>,
{
    deserializer.deserialize_map(MapVisitor(PhantomData))
}

struct MapVisitor<K, V>(PhantomData<(K, V)>);

impl<'de, K, V> Visitor<'de> for MapVisitor<K, V>
where
    K: TryFrom<u64> + Ord,
    V: Deserialize<'de>,
{
    type Value = BTreeMap<K, V>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map with integer keys")
    }

    fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut map = BTreeMap::new();
        while let Some((IntegerKey(key), value)) = access.next_entry::<IntegerKey, V>()? {
            let key = K::try_from(key).map_err(|_| de::Error::custom(format!("map key {key} out of range")))?;
            map.insert(key, value);
        }
        Ok(map)
    }
}

struct IntegerKey(u64);

impl<'de> Deserialize<'de> for IntegerKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(IntegerKeyVisitor)
    }
}

struct IntegerKeyVisitor;

impl<'de> Visitor<'de> for IntegerKeyVisitor {
    type Value = IntegerKey;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an unsigned integer or its decimal string")
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<IntegerKey, E> {
        Ok(IntegerKey(value))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<IntegerKey, E> {
        u64::try_from(value)
            .map(IntegerKey)
            .map_err(|_| E::custom(format!("negative map key {value}")))
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<IntegerKey, E> {
        value
            .parse()
            .map(IntegerKey)
            .map_err(|_| E::custom(format!("map key {value:?} is not an unsigned integer")))
    }
}
