use std::sync::Arc;

use crate::rule::Scheme;

/// Snapshot of one proxied exchange, pushed to the recorder as it
/// progresses: once when the request is accepted, again when the
/// response head is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub id: u64,
    pub method: String,
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Present from the response-head update onward.
    pub status: Option<u16>,
}

/// Consumed interface for traffic recording. Calls are opportunistic;
/// implementations must not block the caller for long.
pub trait Recorder: Send + Sync + 'static {
    fn emit_update(&self, record: &RequestRecord);
    fn emit_update_body(&self, id: u64, chunk: &[u8]);
}

/// The builder demands an explicit choice so a forgotten recorder is a
/// startup error rather than silent data loss.
#[derive(Clone, Default)]
pub(crate) enum RecorderChoice {
    #[default]
    Unset,
    Disabled,
    Enabled(Arc<dyn Recorder>),
}

impl RecorderChoice {
    pub(crate) fn resolved(&self) -> Option<Option<Arc<dyn Recorder>>> {
        match self {
            Self::Unset => None,
            Self::Disabled => Some(None),
            Self::Enabled(recorder) => Some(Some(Arc::clone(recorder))),
        }
    }
}
