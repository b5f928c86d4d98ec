//! Shared types.

use core::fmt;
use once_cell::sync::Lazy;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;
use std::time::Duration as StdDuration;

/// The namespace and name of an object. Renders as `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A regular expression.
///
/// `Regex` has same syntax and semantics as Rust's
/// [`regex` crate](https://docs.rs/regex/latest/regex/).
/// Envoy evaluates regexes with RE2, which accepts the same syntax for
/// everything route matching needs.
#[derive(Clone)]
pub struct Regex(regex::Regex);

impl fmt::Debug for Regex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.write_str(self.0.as_str())
    }
}

impl std::ops::Deref for Regex {
    type Target = regex::Regex;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromStr for Regex {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match regex::Regex::try_from(s) {
            Ok(e) => Ok(Self(e)),
            Err(e) => Err(e.to_string()),
        }
    }
}

impl Serialize for Regex {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.0.as_str())
    }
}

struct RegexVisitor;

impl<'de> Visitor<'de> for RegexVisitor {
    type Value = Regex;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a Regex")
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Regex::from_str(value).map_err(|e| E::custom(format!("could not parse {value}: {e}")))
    }
}

impl<'de> Deserialize<'de> for Regex {
    fn deserialize<D>(deserializer: D) -> Result<Regex, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_string(RegexVisitor)
    }
}

impl PartialEq for Regex {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_str() == other.0.as_str()
    }
}

/// A wrapper around [std::time::Duration] that deserializes from a number of
/// seconds or a Go-style duration string like `1m30s` or `250ms`, and always
/// serializes to a float number of seconds.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Duration(StdDuration);

impl Duration {
    pub const fn from_secs(secs: u64) -> Self {
        Duration(StdDuration::from_secs(secs))
    }

    pub const fn from_millis(millis: u64) -> Self {
        Duration(StdDuration::from_millis(millis))
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Duration(StdDuration::from_secs_f64(secs))
    }
}

impl std::ops::Deref for Duration {
    type Target = StdDuration;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Duration> for StdDuration {
    fn from(val: Duration) -> Self {
        val.0
    }
}

impl From<StdDuration> for Duration {
    fn from(duration: StdDuration) -> Self {
        Duration(duration)
    }
}

static DURATION_PART: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"(\d+(?:\.\d+)?)(ms|h|m|s)").expect("invalid duration regex"));

impl FromStr for Duration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("empty duration".to_string());
        }

        let mut total = 0.0f64;
        let mut consumed = 0;
        for caps in DURATION_PART.captures_iter(s) {
            // every part has to be contiguous with the last one or there's
            // junk in the middle of the string.
            let whole = caps.get(0).expect("capture group 0 always matches");
            if whole.start() != consumed {
                return Err(format!("invalid duration: {s}"));
            }
            consumed = whole.end();

            let value: f64 = caps[1]
                .parse()
                .map_err(|_| format!("invalid duration: {s}"))?;
            total += match &caps[2] {
                "h" => value * 3600.0,
                "m" => value * 60.0,
                "s" => value,
                "ms" => value / 1000.0,
                _ => unreachable!("unit is constrained by the regex"),
            };
        }

        if consumed != s.len() {
            return Err(format!("invalid duration: {s}"));
        }

        Ok(Duration::from_secs_f64(total))
    }
}

impl Serialize for Duration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(self.as_secs_f64())
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a Duration expressed as a number of seconds or a string")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Duration::from_str(v).map_err(E::custom)
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if v.is_sign_negative() || !v.is_finite() {
                    return Err(E::custom("Duration must be a positive number"));
                }
                Ok(Duration::from_secs_f64(v))
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(Duration::from_secs(v))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let v: u64 = v
                    .try_into()
                    .map_err(|_| E::custom("Duration cannot be negative"))?;

                Ok(Duration::from_secs(v))
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_duration_deserialize() {
        #[derive(Debug, Deserialize, PartialEq, Eq)]
        struct SomeValue {
            string_duration: Duration,
            float_duration: Duration,
            int_duration: Duration,
        }

        let value = serde_json::json!({
            "string_duration": "1h23m4s",
            "float_duration": 1.234,
            "int_duration": 1234,
        });

        assert_eq!(
            serde_json::from_value::<SomeValue>(value).unwrap(),
            SomeValue {
                string_duration: Duration::from_secs(3600 + 23 * 60 + 4),
                float_duration: Duration::from_millis(1234),
                int_duration: Duration::from_secs(1234),
            }
        );
    }

    #[test]
    fn test_duration_parse() {
        assert_eq!("15s".parse::<Duration>(), Ok(Duration::from_secs(15)));
        assert_eq!("250ms".parse::<Duration>(), Ok(Duration::from_millis(250)));
        assert_eq!("1m30s".parse::<Duration>(), Ok(Duration::from_secs(90)));

        assert!("".parse::<Duration>().is_err());
        assert!("15".parse::<Duration>().is_err());
        assert!("15s garbage".parse::<Duration>().is_err());
        assert!("x15s".parse::<Duration>().is_err());
    }

    #[test]
    fn test_duration_serialize() {
        #[derive(Debug, Serialize)]
        struct SomeValue {
            duration: Duration,
        }

        assert_eq!(
            serde_json::json!({ "duration": 1.5 }),
            serde_json::to_value(SomeValue {
                duration: Duration::from_millis(1500),
            })
            .unwrap(),
        );
    }

    #[test]
    fn test_regex_serde() {
        let regex: Regex = serde_json::from_value(serde_json::json!("/foo/[0-9]+")).unwrap();
        assert!(regex.is_match("/foo/123"));
        assert_eq!(serde_json::to_value(&regex).unwrap(), "/foo/[0-9]+");

        assert!(serde_json::from_value::<Regex>(serde_json::json!("/foo/[")).is_err());
    }

    #[test]
    fn test_namespaced_name_display() {
        assert_eq!(NamespacedName::new("default", "gw").to_string(), "default/gw");
    }
}
