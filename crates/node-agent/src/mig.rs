//! Decoding of MIG device names.
//!
//! MIG devices are published as `mig-p<profileID>-s<sliceStart>-n<sliceCount>`.
//! Only the syntax is checked here; whether the profile and placement exist on
//! the hardware is up to the MIG backend.

const PREFIX: &str = "mig";
const PROFILE_SEP: &str = "-p";
const START_SEP: &str = "-s";
const COUNT_SEP: &str = "-n";

/// Profile and slice placement encoded in a MIG device name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigPlacement {
    pub profile_id: u32,
    pub slice_start: u32,
    pub slice_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MigNameError {
    #[error("invalid MIG device name `{name}`: missing `{separator}`")]
    MissingSeparator {
        name: String,
        separator: &'static str,
    },

    #[error("invalid MIG device name `{name}`: expected prefix `mig`, found `{prefix}`")]
    BadPrefix { name: String, prefix: String },

    #[error("invalid MIG device name `{name}`: {field} `{value}` is not a non-negative integer")]
    NotANumber {
        name: String,
        field: &'static str,
        value: String,
    },
}

/// Parses `mig-p<profileID>-s<sliceStart>-n<sliceCount>`.
pub fn parse_mig_device_name(name: &str) -> Result<MigPlacement, MigNameError> {
    let split = |sep: &'static str, rest: &str| -> Result<(String, String), MigNameError> {
        rest.split_once(sep)
            .map(|(head, tail)| (head.to_string(), tail.to_string()))
            .ok_or_else(|| MigNameError::MissingSeparator {
                name: name.to_string(),
                separator: sep,
            })
    };

    let (prefix, rest) = split(PROFILE_SEP, name)?;
    if prefix != PREFIX {
        return Err(MigNameError::BadPrefix {
            name: name.to_string(),
            prefix,
        });
    }
    let (profile, rest) = split(START_SEP, &rest)?;
    let (start, count) = split(COUNT_SEP, &rest)?;

    Ok(MigPlacement {
        profile_id: parse_segment(name, "profile id", &profile)?,
        slice_start: parse_segment(name, "slice start", &start)?,
        slice_count: parse_segment(name, "slice count", &count)?,
    })
}

fn parse_segment(name: &str, field: &'static str, value: &str) -> Result<u32, MigNameError> {
    let not_a_number = || MigNameError::NotANumber {
        name: name.to_string(),
        field,
        value: value.to_string(),
    };
    // u32::from_str accepts a leading '+', the grammar does not
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(not_a_number());
    }
    value.parse().map_err(|_| not_a_number())
}
