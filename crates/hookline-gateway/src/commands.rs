use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use hookline_core::HooklineConfig;
use hookline_discord::{WebhookDelivery, WebhookPayload};
use hookline_scheduler::{
    recurrence, DispatchEngine, MessageStore, NewScheduledMessage, ScheduledMessage, SystemClock,
};
use tokio::sync::watch;
use tracing::info;

use serde_json::Value;

use crate::cli::{Command, ContentArgs, PatternArgs, ScheduleCommand, WebhookCommand};

pub async fn dispatch(command: Command, store: MessageStore, config: &HooklineConfig) -> anyhow::Result<()> {
    let now = Utc::now();
    match command {
        Command::Run => run(store, config).await,
        Command::Webhook(WebhookCommand::Add { name, url, user }) => {
            let webhook = store.create_webhook(&user, &name, &url, now)?;
            println!("{}", webhook.id);
            Ok(())
        }
        Command::Webhook(WebhookCommand::List { user }) => {
            for w in store.list_webhooks(user.as_deref())? {
                println!("{}  {:<20} {}", w.id, w.name, w.user_id);
            }
            Ok(())
        }
        Command::Schedule(cmd) => {
            let msg = store.create(new_message(cmd)?, now)?;
            println!("{}", msg.id);
            print_next(&msg);
            Ok(())
        }
        Command::List { user } => {
            for msg in store.list(user.as_deref())? {
                print_summary(&msg);
            }
            Ok(())
        }
        Command::Show { id } => {
            let msg = store
                .get(&id)?
                .with_context(|| format!("no scheduled message with id {id}"))?;
            println!("{}", serde_json::to_string_pretty(&msg)?);
            Ok(())
        }
        Command::Pause { id } => {
            print_summary(&store.pause(&id, now)?);
            Ok(())
        }
        Command::Resume { id } => {
            let msg = store.resume(&id, now)?;
            print_summary(&msg);
            print_next(&msg);
            Ok(())
        }
        Command::Delete { id } => {
            store.delete(&id)?;
            println!("deleted {id}");
            Ok(())
        }
        Command::History { id } => {
            for log in store.history(&id)? {
                let outcome = if log.success { "ok" } else { "failed" };
                println!(
                    "{}  {:<6} attempts={} {}",
                    log.attempted_at.to_rfc3339(),
                    outcome,
                    log.attempts,
                    log.error.as_deref().unwrap_or("")
                );
            }
            Ok(())
        }
        Command::Preview { pattern, count } => preview(&pattern, count, now),
    }
}

/// Dispatch loop with Ctrl-C shutdown.
async fn run(store: MessageStore, config: &HooklineConfig) -> anyhow::Result<()> {
    let delivery = Arc::new(WebhookDelivery::new(store.clone(), &config.delivery)?);
    let engine = DispatchEngine::new(
        store,
        delivery,
        Arc::new(SystemClock),
        &config.scheduler,
        &config.delivery,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(engine.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    handle.await?;
    Ok(())
}

fn new_message(cmd: ScheduleCommand) -> anyhow::Result<NewScheduledMessage> {
    match cmd {
        ScheduleCommand::Once {
            webhook,
            at,
            content,
            user,
        } => {
            let at = DateTime::parse_from_rfc3339(&at)
                .with_context(|| format!("--at '{at}' is not an RFC 3339 instant"))?
                .with_timezone(&Utc);
            Ok(NewScheduledMessage::once(&user, &webhook, checked_content(&content)?, at))
        }
        ScheduleCommand::Recurring {
            webhook,
            pattern,
            content,
            max_sends,
            template,
            user,
        } => {
            let mut new = NewScheduledMessage::recurring(
                &user,
                &webhook,
                checked_content(&content)?,
                pattern.pattern(),
                &pattern.timezone,
            );
            if let Some(max) = max_sends {
                new = new.with_max_sends(max);
            }
            if let Some(template) = template {
                new = new.with_template(&template);
            }
            Ok(new)
        }
    }
}

/// The message body, rejected up front if Discord would refuse it.
fn checked_content(args: &ContentArgs) -> anyhow::Result<Value> {
    let content = args.content()?;
    WebhookPayload::from_content(&content)
        .context("message content is not a valid webhook payload")?;
    Ok(content)
}

fn preview(args: &PatternArgs, count: usize, now: DateTime<Utc>) -> anyhow::Result<()> {
    let pattern = args.pattern();
    recurrence::validate(&pattern, &args.timezone).map_err(anyhow::Error::msg)?;
    let tz = recurrence::parse_tz(&args.timezone);
    for ts in recurrence::upcoming(&pattern, &args.timezone, now, count) {
        println!("{}  ({})", ts.to_rfc3339(), ts.with_timezone(&tz).format("%a %Y-%m-%d %H:%M %Z"));
    }
    Ok(())
}

fn print_summary(msg: &ScheduledMessage) {
    let next = msg
        .next_send_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".into());
    let cap = msg
        .max_sends
        .map(|m| m.to_string())
        .unwrap_or_else(|| "∞".into());
    println!(
        "{}  {:<10} {:<9} next={} sends={}/{}",
        msg.id,
        msg.status.to_string(),
        msg.schedule_type.to_string(),
        next,
        msg.send_count,
        cap
    );
}

fn print_next(msg: &ScheduledMessage) {
    match msg.next_send_at {
        Some(next) => println!("next send: {}", next.to_rfc3339()),
        None => println!("no further sends scheduled"),
    }
}
