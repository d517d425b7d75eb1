use std::collections::HashSet;
use std::sync::Mutex;

use uuid::Uuid;

use murmur_engine::{PresenceSnapshot, PresenceView, TimelineSnapshot, TimelineView};
use murmur_types::Message;

/// Prints a channel to stdout as it changes.
///
/// A terminal cannot redraw history, so each render prints only messages
/// not yet shown; an older page arrives as a marked block.
#[derive(Default)]
pub struct ConsoleView {
    shown: Mutex<HashSet<Uuid>>,
}

impl ConsoleView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines to print for `snapshot`, marking their messages as shown.
    pub fn render(&self, snapshot: &TimelineSnapshot) -> Vec<String> {
        let mut shown = self.shown.lock().unwrap_or_else(|e| e.into_inner());

        let first_shown = snapshot
            .messages
            .iter()
            .position(|m| shown.contains(&m.id));
        let mut lines = Vec::new();

        for (i, msg) in snapshot.messages.iter().enumerate() {
            if !shown.insert(msg.id) {
                continue;
            }
            // Messages sorted before the ones already printed came from an
            // older page.
            if i == 0 && first_shown.is_some() {
                lines.push("-- earlier messages --".to_string());
            }
            lines.push(format_message(msg, snapshot.is_mine(msg)));
        }

        if lines.is_empty() && snapshot.messages.is_empty() && !snapshot.has_more_older {
            lines.push("(no messages yet)".to_string());
        }
        lines
    }

    /// Forget everything printed, e.g. after switching channels.
    pub fn reset(&self) {
        self.shown.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl TimelineView for ConsoleView {
    fn on_timeline_changed(&self, snapshot: &TimelineSnapshot, _auto_scroll: bool) {
        for line in self.render(snapshot) {
            println!("{}", line);
        }
    }
}

pub fn format_message(msg: &Message, mine: bool) -> String {
    let who = if mine {
        format!("{} (you)", msg.author_display_name)
    } else {
        msg.author_display_name.clone()
    };
    format!("[{}] {}: {}", msg.inserted_at.format("%H:%M"), who, msg.body)
}

pub fn format_presence(snapshot: &PresenceSnapshot) -> String {
    let names: Vec<String> = snapshot
        .peers
        .iter()
        .map(|p| {
            if p.is_self {
                format!("{} (you)", p.display_name)
            } else {
                p.display_name.clone()
            }
        })
        .collect();
    format!("online ({}): {}", snapshot.online_count(), names.join(", "))
}

/// Prints the online list whenever it changes.
pub struct PresenceLine;

impl PresenceView for PresenceLine {
    fn on_presence_changed(&self, snapshot: &PresenceSnapshot) {
        println!("{}", format_presence(snapshot));
    }
}
