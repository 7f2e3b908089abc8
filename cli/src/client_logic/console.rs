use colored::*;
use lib_alerts::{Alert, AlertSink, ConnectionState};

/// Renders sink events on the terminal, one colour per event kind.
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl ConsoleSink {
    pub fn new() -> Self {
        Self
    }

    fn timestamp() -> ColoredString {
        chrono::Local::now()
            .format("[%Y-%m-%d %H:%M:%S]")
            .to_string()
            .truecolor(128, 128, 128)
    }
}

pub fn format_alert(alert: &Alert) -> String {
    let position = match (alert.sequence, alert.total) {
        (Some(seq), Some(total)) => format!(" ({}/{})", seq, total),
        _ => String::new(),
    };
    format!("{}{}: {}", alert.title, position, alert.message)
}

fn state_color(state: ConnectionState, text: String) -> ColoredString {
    match state {
        ConnectionState::Connecting | ConnectionState::Reconnecting => text.bright_yellow(),
        ConnectionState::Connected => text.bright_green(),
        ConnectionState::Waiting => text.bright_white(),
        ConnectionState::Stopped => text.bright_cyan(),
        ConnectionState::Failed => text.bright_red(),
    }
}

impl AlertSink for ConsoleSink {
    fn on_alert(&self, alert: &Alert) {
        let mut line = format_alert(alert).bright_white().on_blue().to_string();
        if let Some(wait) = alert.wait_time() {
            line.push_str(&format!(" {}", format!("waited {}ms", wait.as_millis()).truecolor(128, 128, 128)));
        }
        println!("{}{} {}", Self::timestamp(), "[alert]".truecolor(128, 128, 128), line);
    }

    fn on_error(&self, message: &str) {
        println!(
            "{}{} {}",
            Self::timestamp(),
            "[error]".truecolor(128, 128, 128),
            message.bright_white().on_bright_red()
        );
    }

    fn on_status(&self, state: ConnectionState, message: &str) {
        println!(
            "{}{} {}",
            Self::timestamp(),
            format!("[{}]", state).truecolor(128, 128, 128),
            state_color(state, message.to_string())
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_position_is_shown() {
        let alert = Alert::new("a1", "Disk", "Almost full").in_batch(2, 3);
        assert_eq!(format_alert(&alert), "Disk (2/3): Almost full");
        assert_eq!(format_alert(&Alert::new("a2", "Disk", "ok")), "Disk: ok");
    }
}
