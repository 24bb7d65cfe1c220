use serde::{Deserialize, Serialize};

/// Browser tab identifier.
///
/// Interception events carry the numeric id of the tab they originated in.
/// Traffic that cannot be attributed to an open tab (background fetches,
/// service workers) is reported with [`TabId::NONE`] and resolved through
/// the origin tracker instead.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TabId(pub i64);

impl TabId {
    /// Sentinel for traffic not attributable to any open tab.
    pub const NONE: TabId = TabId(-1);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl std::fmt::Display for TabId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque request identifier assigned by the interception layer.
///
/// Unique per tab; the composite key `(TabId, RequestId)` identifies one
/// captured request.
pub type RequestId = String;

/// One request or response header. Order is preserved as captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Which capture path last wrote a record: ordinary interception or the
/// per-tab deep-inspection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureOrigin {
    Interception,
    Inspector,
}
