//! Script back-channel: `[NZB] KEY=value` stdout lines
//!
//! Post-processing scripts run as opaque child processes. Lines they print
//! with the `[NZB]` prefix are commands back to the engine; everything else
//! is plain output. Unknown commands are reported as errors against the NZB
//! but never crash anything.

use std::path::PathBuf;

use crate::types::MarkStatus;

const NZB_PREFIX: &str = "[NZB] ";

/// A parsed back-channel command
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptCommand {
    /// `DIRECTORY=<path>`: move the download to a new destination
    Directory(PathBuf),
    /// `NZBPR_<name>=<value>`: set a post-processing parameter
    Parameter {
        /// Parameter name (without the `NZBPR_` prefix)
        name: String,
        /// Parameter value
        value: String,
    },
    /// `MARK=GOOD` / `MARK=BAD`
    Mark(MarkStatus),
    /// `PRIORITY=<n>`: change the NZB priority
    Priority(i32),
}

/// Parse one stdout line.
///
/// - `None`: not a back-channel line (plain script output)
/// - `Some(Ok(_))`: a recognised command
/// - `Some(Err(_))`: an `[NZB]` line the engine does not understand; the
///   message should be logged against the NZB
pub fn parse_script_line(line: &str) -> Option<Result<ScriptCommand, String>> {
    let rest = line.strip_prefix(NZB_PREFIX)?;
    let Some((key, value)) = rest.split_once('=') else {
        return Some(Err(format!("malformed script command: {rest}")));
    };
    let key = key.trim();
    let value = value.trim();

    let command = match key {
        "DIRECTORY" => {
            if value.is_empty() {
                return Some(Err("DIRECTORY command with empty path".into()));
            }
            ScriptCommand::Directory(PathBuf::from(value))
        }
        "MARK" => match value {
            "GOOD" => ScriptCommand::Mark(MarkStatus::Good),
            "BAD" => ScriptCommand::Mark(MarkStatus::Bad),
            other => return Some(Err(format!("unknown MARK value: {other}"))),
        },
        "PRIORITY" => match value.parse() {
            Ok(priority) => ScriptCommand::Priority(priority),
            Err(_) => return Some(Err(format!("bad PRIORITY value: {value}"))),
        },
        _ => {
            if let Some(name) = key.strip_prefix("NZBPR_") {
                if name.is_empty() {
                    return Some(Err("NZBPR_ command with empty name".into()));
                }
                ScriptCommand::Parameter {
                    name: name.to_string(),
                    value: value.to_string(),
                }
            } else {
                return Some(Err(format!("unknown script command: {key}")));
            }
        }
    };
    Some(Ok(command))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_output_is_not_a_command() {
        assert!(parse_script_line("extracting volume 3 of 7").is_none());
        assert!(parse_script_line("[OTHER] DIRECTORY=/x").is_none());
        assert!(parse_script_line("").is_none());
    }

    #[test]
    fn directory_command_parses() {
        let command = parse_script_line("[NZB] DIRECTORY=/data/complete/tv")
            .unwrap()
            .unwrap();
        assert_eq!(
            command,
            ScriptCommand::Directory(PathBuf::from("/data/complete/tv"))
        );
    }

    #[test]
    fn parameter_command_strips_the_prefix() {
        let command = parse_script_line("[NZB] NZBPR_my_option=42").unwrap().unwrap();
        assert_eq!(
            command,
            ScriptCommand::Parameter {
                name: "my_option".into(),
                value: "42".into(),
            }
        );
    }

    #[test]
    fn mark_commands_parse_good_and_bad() {
        assert_eq!(
            parse_script_line("[NZB] MARK=BAD").unwrap().unwrap(),
            ScriptCommand::Mark(MarkStatus::Bad)
        );
        assert_eq!(
            parse_script_line("[NZB] MARK=GOOD").unwrap().unwrap(),
            ScriptCommand::Mark(MarkStatus::Good)
        );
    }

    #[test]
    fn priority_command_parses_signed_numbers() {
        assert_eq!(
            parse_script_line("[NZB] PRIORITY=-100").unwrap().unwrap(),
            ScriptCommand::Priority(-100)
        );
    }

    #[test]
    fn unknown_commands_are_errors_not_panics() {
        assert!(parse_script_line("[NZB] FROBNICATE=yes").unwrap().is_err());
        assert!(parse_script_line("[NZB] MARK=MEDIOCRE").unwrap().is_err());
        assert!(parse_script_line("[NZB] PRIORITY=high").unwrap().is_err());
        assert!(parse_script_line("[NZB] no equals sign").unwrap().is_err());
        assert!(parse_script_line("[NZB] DIRECTORY=").unwrap().is_err());
    }
}
