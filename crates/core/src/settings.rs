use std::{collections::BTreeMap, fmt};

/// Numeric tag identifying one entry in a [`Settings`] dictionary.
///
/// The tag vocabulary belongs to the application and the driver; the
/// pipeline core treats it as opaque except for the handful of entries in
/// [`tags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SettingTag(pub u32);

impl fmt::Display for SettingTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag:{:#06x}", self.0)
    }
}

/// Well-known tags the pipeline itself reads.
pub mod tags {
    use super::SettingTag;

    /// Application-assigned request identifier, echoed in notifications so
    /// callers can correlate submissions with results.
    pub const REQUEST_ID: SettingTag = SettingTag(0x0001);
    /// One-shot autofocus trigger.
    pub const AF_TRIGGER: SettingTag = SettingTag(0x0010);
    /// One-shot precapture metering trigger.
    pub const PRECAPTURE_TRIGGER: SettingTag = SettingTag(0x0011);
}

/// Value stored under a [`SettingTag`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SettingValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point.
    Float(f64),
    /// Free-form bytes (driver-defined encoding).
    Bytes(Vec<u8>),
}

impl SettingValue {
    /// Integer view, if this value is an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            SettingValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

/// Ordered tag → value dictionary carried by every capture request.
///
/// Insert and remove return the previous value so one-shot entries (see
/// [`Trigger`]) can be spliced in and later restored exactly.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::{SettingTag, SettingValue, Settings};
///
/// let mut settings = Settings::new();
/// let prior = settings.insert(SettingTag(7), SettingValue::Int(1));
/// assert!(prior.is_none());
/// let prior = settings.insert(SettingTag(7), SettingValue::Int(2));
/// assert_eq!(prior, Some(SettingValue::Int(1)));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Settings {
    entries: BTreeMap<SettingTag, SettingValue>,
}

impl Settings {
    /// Empty dictionary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a value.
    pub fn get(&self, tag: SettingTag) -> Option<&SettingValue> {
        self.entries.get(&tag)
    }

    /// Insert a value, returning the previous value for the tag if any.
    pub fn insert(&mut self, tag: SettingTag, value: SettingValue) -> Option<SettingValue> {
        self.entries.insert(tag, value)
    }

    /// Remove a tag, returning the removed value if present.
    pub fn remove(&mut self, tag: SettingTag) -> Option<SettingValue> {
        self.entries.remove(&tag)
    }

    /// Whether a tag is present.
    pub fn contains(&self, tag: SettingTag) -> bool {
        self.entries.contains_key(&tag)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the dictionary is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in tag order.
    pub fn iter(&self) -> impl Iterator<Item = (SettingTag, &SettingValue)> {
        self.entries.iter().map(|(tag, value)| (*tag, value))
    }

    /// Application-assigned request id, if the dictionary carries one.
    pub fn request_id(&self) -> Option<i64> {
        self.get(tags::REQUEST_ID).and_then(SettingValue::as_int)
    }
}

/// A one-shot setting merged into exactly one outgoing request.
///
/// The engine splices the trigger into the next request it builds and
/// restores the tag's prior value immediately afterwards, so triggers never
/// leak into subsequent submissions.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::{SettingValue, Trigger, tags};
///
/// let trigger = Trigger::new(tags::AF_TRIGGER, SettingValue::Int(1));
/// assert_eq!(trigger.tag, tags::AF_TRIGGER);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    /// Tag to overwrite for one request.
    pub tag: SettingTag,
    /// Value to splice in.
    pub value: SettingValue,
}

impl Trigger {
    /// Build a trigger.
    pub fn new(tag: SettingTag, value: SettingValue) -> Self {
        Self { tag, value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_returns_prior_value() {
        let mut settings = Settings::new();
        assert_eq!(settings.insert(SettingTag(1), SettingValue::Int(10)), None);
        assert_eq!(
            settings.insert(SettingTag(1), SettingValue::Int(20)),
            Some(SettingValue::Int(10))
        );
        assert_eq!(settings.get(SettingTag(1)), Some(&SettingValue::Int(20)));
    }

    #[test]
    fn remove_returns_prior_value() {
        let mut settings = Settings::new();
        settings.insert(SettingTag(2), SettingValue::Bool(true));
        assert_eq!(
            settings.remove(SettingTag(2)),
            Some(SettingValue::Bool(true))
        );
        assert_eq!(settings.remove(SettingTag(2)), None);
    }

    #[test]
    fn request_id_reads_well_known_tag() {
        let mut settings = Settings::new();
        assert_eq!(settings.request_id(), None);
        settings.insert(tags::REQUEST_ID, SettingValue::Int(42));
        assert_eq!(settings.request_id(), Some(42));
    }

    #[test]
    fn iteration_is_tag_ordered() {
        let mut settings = Settings::new();
        settings.insert(SettingTag(9), SettingValue::Int(9));
        settings.insert(SettingTag(1), SettingValue::Int(1));
        let tags: Vec<u32> = settings.iter().map(|(tag, _)| tag.0).collect();
        assert_eq!(tags, vec![1, 9]);
    }
}
