//! Output formatting for the CLI.

use auth_engine::SessionState;
use clap::ValueEnum;
use serde::Serialize;

/// Output format.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Print a value as pretty JSON, or through `text` in text mode.
pub fn print<T: Serialize>(value: &T, format: &OutputFormat, text: impl FnOnce(&T)) {
    match format {
        OutputFormat::Text => text(value),
        OutputFormat::Json => match serde_json::to_string_pretty(value) {
            Ok(json) => println!("{}", json),
            Err(_) => text(value),
        },
    }
}

/// Print a session as rendered by the foreground.
pub fn print_session(session: &SessionState, format: &OutputFormat) {
    print(session, format, |session| {
        let state = if session.is_loading {
            "loading"
        } else if session.is_authenticated {
            "signed in"
        } else {
            "signed out"
        };
        print_row("Session", state);
        if let Some(user) = &session.user {
            print_row("User", &user.id);
            if let Some(name) = &user.full_name {
                print_row("Name", name);
            }
            if let Some(email) = &user.email {
                print_row("Email", email);
            }
        }
        if let Some(error) = session.error {
            print_row("Error", &format!("{error:?}"));
        }
    });
}

/// Print a success message.
pub fn print_success(message: &str, format: &OutputFormat) {
    match format {
        OutputFormat::Text => println!("{}", message),
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "status": "success", "message": message }));
        }
    }
}

/// Print an error message.
pub fn print_error(message: &str, format: &OutputFormat) {
    match format {
        OutputFormat::Text => eprintln!("Error: {}", message),
        OutputFormat::Json => {
            eprintln!("{}", serde_json::json!({ "status": "error", "message": message }));
        }
    }
}

/// Print a table row.
pub fn print_row(label: &str, value: &str) {
    println!("  {:<16} {}", format!("{}:", label), value);
}
