//! Server-to-client notices. Sent as-is, no line terminator.

use std::time::Duration;

pub fn strike(strikes: u32, timeout: Duration) -> String {
    format!(
        "Strike number {strikes}. You are timed out. Wait for {}",
        timeout.as_secs()
    )
}

pub fn still_timed_out(remaining: Duration) -> String {
    format!("You are timed out. Chill for {:.6} Seconds", remaining.as_secs_f64())
}

pub fn banned() -> &'static str {
    "you are banned. bye bye"
}
