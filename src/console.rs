//! # Operator Console
//!
//! Line commands read from stdin by the binary.
//!
//! | Command | Effect |
//! |---------|--------|
//! | `start <id>` | AVAILABLE -> ACTIVE |
//! | `pause <id>` | ACTIVE -> PAUSED |
//! | `resume <id>` | PAUSED -> ACTIVE |
//! | `finish <id>` | ACTIVE/PAUSED -> FINISHED |
//! | `sync` | Run a sync pass now |
//! | `status` | Print network and queue status |
//! | `courses` | List known courses |
//! | `logout` | Stop every course and clear local tracking |
//! | `quit` | Shut down |

use crate::course::controller::Course;
use crate::course::status::CourseStatus;
use crate::network::NetworkState;
use crate::sync::SyncStats;

/// A parsed console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetStatus {
        course_id: String,
        status: CourseStatus,
    },
    Sync,
    Status,
    Courses,
    Logout,
    Quit,
    Help,
}

/// Parse one input line. Blank lines yield `Ok(None)`.
///
/// # Examples
///
/// ```
/// use course_telemetry::console::{parse_command, Command};
/// use course_telemetry::course::status::CourseStatus;
///
/// assert_eq!(
///     parse_command("pause c1").unwrap(),
///     Some(Command::SetStatus { course_id: "c1".into(), status: CourseStatus::Paused })
/// );
/// ```
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let argument = words.next();
    if words.next().is_some() {
        return Err(format!("too many arguments for '{}'", verb));
    }

    let status = match verb.to_ascii_lowercase().as_str() {
        "start" | "resume" => CourseStatus::Active,
        "pause" => CourseStatus::Paused,
        "finish" => CourseStatus::Finished,
        other => {
            if argument.is_some() {
                return Err(format!("'{}' takes no argument", other));
            }
            return match other {
                "sync" => Ok(Some(Command::Sync)),
                "status" => Ok(Some(Command::Status)),
                "courses" => Ok(Some(Command::Courses)),
                "logout" => Ok(Some(Command::Logout)),
                "quit" | "exit" => Ok(Some(Command::Quit)),
                "help" | "?" => Ok(Some(Command::Help)),
                _ => Err(format!("unknown command '{}'", other)),
            };
        }
    };

    match argument {
        Some(course_id) => Ok(Some(Command::SetStatus {
            course_id: course_id.to_string(),
            status,
        })),
        None => Err(format!("'{}' needs a course id", verb)),
    }
}

pub const HELP: &str = "commands: start|pause|resume|finish <course-id>, sync, status, courses, logout, quit";

/// Status line combining network state and queue statistics.
pub fn render_status(network: &NetworkState, stats: &SyncStats) -> String {
    let mut line = stats.summary(network.is_online);
    line.push_str(&format!(
        " | synced {} | dropped {}",
        stats.total_synced, stats.sync_errors
    ));
    if network.consecutive_failures > 0 {
        line.push_str(&format!(" | {} failures in a row", network.consecutive_failures));
    }
    if let Some(at) = stats.last_sync_attempt {
        line.push_str(&format!(" | last sync {}", at.format("%H:%M:%S")));
    }
    line
}

/// One line per course.
pub fn render_courses(courses: &[Course]) -> String {
    if courses.is_empty() {
        return "no courses".to_string();
    }
    courses
        .iter()
        .map(|c| format!("{:<12} {:<16} {}", c.id, c.uit, c.status))
        .collect::<Vec<_>>()
        .join("\n")
}
