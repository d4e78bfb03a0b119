use clap::{Args, Parser, Subcommand, ValueEnum};
use hookline_scheduler::{Frequency, RecurrencePattern};
use serde_json::Value;

/// hookline — scheduled and recurring Discord webhook messages.
#[derive(Debug, Parser)]
#[command(name = "hookline", version, about)]
pub struct Cli {
    /// Config file (defaults to $HOOKLINE_CONFIG, then ~/.hookline/hookline.toml).
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the dispatch loop until Ctrl-C (default when no subcommand is given).
    Run,
    /// Manage webhooks.
    #[command(subcommand)]
    Webhook(WebhookCommand),
    /// Create a scheduled message.
    #[command(subcommand)]
    Schedule(ScheduleCommand),
    /// List scheduled messages.
    List {
        #[arg(long)]
        user: Option<String>,
    },
    /// Print one scheduled message as JSON.
    Show { id: String },
    /// Pause a recurring message.
    Pause { id: String },
    /// Resume a paused message from now.
    Resume { id: String },
    /// Delete a scheduled message and its history.
    Delete { id: String },
    /// Show send history, newest first.
    History { id: String },
    /// Print the next fire times of a recurrence pattern without saving it.
    Preview {
        #[command(flatten)]
        pattern: PatternArgs,
        /// Number of fire times to print.
        #[arg(long, default_value_t = 5)]
        count: usize,
    },
}

#[derive(Debug, Subcommand)]
pub enum WebhookCommand {
    /// Register a Discord webhook URL.
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        url: String,
        #[arg(long, default_value = "local")]
        user: String,
    },
    /// List registered webhooks.
    List {
        #[arg(long)]
        user: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum ScheduleCommand {
    /// Send once at a fixed instant.
    Once {
        #[arg(long)]
        webhook: String,
        /// RFC 3339 instant, e.g. 2025-01-01T09:00:00Z.
        #[arg(long)]
        at: String,
        #[command(flatten)]
        content: ContentArgs,
        #[arg(long, default_value = "local")]
        user: String,
    },
    /// Send on a daily, weekly or monthly pattern.
    Recurring {
        #[arg(long)]
        webhook: String,
        #[command(flatten)]
        pattern: PatternArgs,
        #[command(flatten)]
        content: ContentArgs,
        /// Stop after this many successful sends.
        #[arg(long)]
        max_sends: Option<u32>,
        #[arg(long)]
        template: Option<String>,
        #[arg(long, default_value = "local")]
        user: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum FrequencyArg {
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Args)]
pub struct PatternArgs {
    #[arg(long, value_enum)]
    pub frequency: FrequencyArg,
    /// Local time of day, HH:MM (default 12:00).
    #[arg(long)]
    pub time: Option<String>,
    /// Weekdays for weekly patterns, 0 = Sunday, comma separated.
    #[arg(long, value_delimiter = ',')]
    pub days: Vec<u8>,
    /// Day of month for monthly patterns (default 1).
    #[arg(long)]
    pub day: Option<u32>,
    /// IANA timezone name.
    #[arg(long, default_value = "UTC")]
    pub timezone: String,
}

impl PatternArgs {
    pub fn pattern(&self) -> RecurrencePattern {
        let frequency = match self.frequency {
            FrequencyArg::Daily => Frequency::Daily,
            FrequencyArg::Weekly => Frequency::Weekly,
            FrequencyArg::Monthly => Frequency::Monthly,
        };
        RecurrencePattern {
            frequency,
            time: self.time.clone(),
            days: self.days.clone(),
            day: self.day,
        }
    }
}

#[derive(Debug, Args)]
pub struct ContentArgs {
    /// Plain text message.
    #[arg(long, conflicts_with = "json", required_unless_present = "json")]
    pub text: Option<String>,
    /// Full webhook payload as JSON (content, embeds, username ...).
    #[arg(long)]
    pub json: Option<String>,
}

impl ContentArgs {
    pub fn content(&self) -> anyhow::Result<Value> {
        match (&self.text, &self.json) {
            (Some(text), _) => Ok(Value::String(text.clone())),
            (None, Some(json)) => Ok(serde_json::from_str(json)?),
            (None, None) => anyhow::bail!("either --text or --json is required"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_recurring_weekly() {
        let cli = Cli::parse_from([
            "hookline",
            "schedule",
            "recurring",
            "--webhook",
            "w-1",
            "--frequency",
            "weekly",
            "--days",
            "1,3,5",
            "--time",
            "09:30",
            "--timezone",
            "Europe/Berlin",
            "--text",
            "standup",
            "--max-sends",
            "10",
        ]);
        let Some(Command::Schedule(ScheduleCommand::Recurring {
            pattern,
            content,
            max_sends,
            ..
        })) = cli.command
        else {
            panic!("wrong command");
        };
        assert_eq!(
            pattern.pattern(),
            RecurrencePattern::weekly(vec![1, 3, 5], "09:30")
        );
        assert_eq!(pattern.timezone, "Europe/Berlin");
        assert_eq!(content.content().unwrap(), Value::String("standup".into()));
        assert_eq!(max_sends, Some(10));
    }

    #[test]
    fn content_requires_text_or_json() {
        let res = Cli::try_parse_from([
            "hookline", "schedule", "once", "--webhook", "w-1", "--at", "2025-01-01T09:00:00Z",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn no_subcommand_means_run() {
        let cli = Cli::parse_from(["hookline"]);
        assert!(cli.command.is_none());
    }
}
