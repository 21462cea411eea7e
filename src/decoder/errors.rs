use thiserror::Error;

use crate::templates::SourceId;

/// Why a packet or record could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("{protocol} packet too short: {len} bytes, need at least {min}")]
    TooShort {
        protocol: &'static str,
        len: usize,
        min: usize,
    },
    #[error("unrecognized flow export version {0}")]
    UnknownVersion(u32),
    #[error("flow-set at offset {offset} declares invalid length {length}")]
    InvalidSetLength { offset: usize, length: u16 },
    #[error("field {field_type} at record offset {offset} needs {length} bytes, {remaining} left")]
    TruncatedField {
        field_type: u16,
        offset: usize,
        length: u16,
        remaining: usize,
    },
}

impl DecodeError {
    /// Whether the whole packet was unusable, as opposed to a single record.
    pub fn is_malformed_packet(&self) -> bool {
        !matches!(self, Self::TruncatedField { .. })
    }
}

/// Packets that are well formed but could not be turned into flows yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    MissingTemplate {
        source_id: SourceId,
        template_id: u16,
        flow_sets: usize,
    },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::MissingTemplate {
                source_id,
                template_id,
                flow_sets,
            } => write!(
                f,
                "missing_template: {} data flow-set(s) reference template {} from {}",
                flow_sets, template_id, source_id
            ),
        }
    }
}
