use anyhow::{Context, Result};
use chrono::{Local, Utc};
use colored::*;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::config::Config;
use crate::core::{Letter, LetterStatus, LetterStore};
use crate::generator::LetterGenerator;
use crate::persona::Persona;
use crate::request::RequestManager;
use crate::scheduler::{BatchReport, BatchScheduler};
use crate::session::{split_hidden, ChatEngine, ChatSession, Segment};

fn open_store(config: &Config) -> Result<Arc<LetterStore>> {
    let store = LetterStore::new(config.storage_path.clone(), config.backup_path.clone())
        .with_context(|| format!("Failed to open letter store at {}", config.storage_path.display()))?;
    Ok(Arc::new(store))
}

fn build_scheduler(config: &Config) -> Result<BatchScheduler> {
    let store = open_store(config)?;
    let generator = LetterGenerator::from_config(config, &Persona::from_config(config))
        .context("Failed to set up letter generation")?;
    Ok(BatchScheduler::new(store, generator, config))
}

fn status_label(status: LetterStatus) -> ColoredString {
    match status {
        LetterStatus::Pending => status.to_string().yellow(),
        LetterStatus::Generated => status.to_string().green(),
        LetterStatus::Delivered => status.to_string().cyan(),
        LetterStatus::Failed => status.to_string().red(),
    }
}

fn print_report(report: &BatchReport) {
    println!("{}", "Batch Report".cyan().bold());
    println!("  Examined:  {}", report.examined);
    println!("  Generated: {}", report.generated.to_string().green());
    println!("  Failed:    {}", report.failed.to_string().red());
    println!("  Deferred:  {}", report.deferred.to_string().yellow());
    println!("  Duration:  {}ms", report.duration_ms);
}

fn print_letter_line(letter: &Letter) {
    println!(
        "  {} [{}] {} - {}",
        letter.id.dimmed(),
        status_label(letter.status),
        letter.requested_time.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
        letter.theme
    );
}

pub async fn handle_run(config: &Config) -> Result<()> {
    if !config.async_letter_enabled {
        println!("{}", "Letter generation is disabled (ASYNC_LETTER_ENABLED=false)".yellow());
        return Ok(());
    }

    let scheduler = build_scheduler(config)?;
    if let Some(next) = scheduler.next_run(Utc::now(), &Local) {
        println!("{} next batch at {}", "Scheduler started,".green(), next.with_timezone(&Local).format("%Y-%m-%d %H:%M"));
    }

    scheduler
        .run(&Local, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    println!("{}", "Scheduler stopped.".cyan());
    Ok(())
}

pub async fn handle_batch(config: &Config) -> Result<()> {
    if !config.async_letter_enabled {
        println!("{}", "Letter generation is disabled (ASYNC_LETTER_ENABLED=false)".yellow());
        return Ok(());
    }

    let scheduler = build_scheduler(config)?;
    let report = scheduler.run_batch(Utc::now(), &Local).await?;
    print_report(&report);
    Ok(())
}

pub fn handle_request(config: &Config, user_id: &str, theme: &str, hour: u32, affinity: Option<u8>) -> Result<()> {
    let requests = RequestManager::new(open_store(config)?, config);
    let affinity = affinity.unwrap_or(config.letter_min_affinity);

    let letter = requests.submit(user_id, theme, hour, affinity, Utc::now(), &Local)?;

    println!("{}", "Letter request accepted".green().bold());
    println!("  ID:    {}", letter.id);
    println!("  Theme: {}", letter.theme);
    println!(
        "  Written after {}",
        letter.requested_time.with_timezone(&Local).format("%Y-%m-%d %H:%M")
    );
    Ok(())
}

pub fn handle_letters(config: &Config, user_id: &str, limit: usize) -> Result<()> {
    let requests = RequestManager::new(open_store(config)?, config);
    let letters = requests.history(user_id, limit)?;

    if letters.is_empty() {
        println!("No letters for {}.", user_id);
        return Ok(());
    }

    println!("{} ({}):", format!("Letters for {}", user_id).cyan().bold(), letters.len());
    for letter in &letters {
        print_letter_line(letter);
    }
    Ok(())
}

pub fn handle_read(config: &Config, letter_id: &str) -> Result<()> {
    let requests = RequestManager::new(open_store(config)?, config);
    let letter = requests.read(letter_id)?;

    println!("{} {}", "Theme:".cyan(), letter.theme);
    println!("{} {}", "Status:".cyan(), status_label(letter.status));
    match (&letter.content, letter.status) {
        (_, LetterStatus::Pending) => println!("\nThis letter has not been written yet."),
        (Some(content), LetterStatus::Failed) => {
            if let Some(reason) = &letter.error {
                println!("{} {}", "Generation failed:".red(), reason);
            }
            println!("\n{}", content);
        }
        (Some(content), _) => println!("\n{}", content),
        (None, _) => println!("\n(no content)"),
    }
    Ok(())
}

pub fn handle_config(config: &Config) -> Result<()> {
    println!("{}", "Configuration".cyan().bold());
    for (key, value) in config.redacted_summary() {
        println!("  {:<28} {}", key, value);
    }

    let problems = config.problems();
    if problems.is_empty() {
        println!("\n{}", "Configuration is valid.".green());
    } else {
        println!("\n{}", "Configuration problems:".red().bold());
        for problem in problems {
            println!("  - {}", problem);
        }
    }
    Ok(())
}

fn render_reply(text: &str, reveal: bool) -> String {
    split_hidden(text)
        .into_iter()
        .map(|segment| match segment {
            Segment::Visible(text) => text,
            Segment::Hidden(text) if reveal => format!("({})", text).magenta().italic().to_string(),
            Segment::Hidden(_) => "…".dimmed().to_string(),
        })
        .collect()
}

/// Terminal chat. Slash commands: /reveal /status /reset /letter /reflect /quit.
pub async fn handle_chat(config: &Config, user_id: Option<String>) -> Result<()> {
    let engine = ChatEngine::from_config(config)?;
    let requests = RequestManager::new(open_store(config)?, config);
    let mut session = ChatSession::new(user_id);
    let mut reveal = false;

    println!("{} ({})", format!("{}と話す", engine.persona().name).cyan().bold(), session.user_id.dimmed());
    println!("{}", "/reveal /status /reset /letter <hour> <theme> /reflect <id> /quit".dimmed());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix('/') {
            let mut parts = command.splitn(3, ' ');
            match parts.next().unwrap_or_default() {
                "quit" | "exit" => break,
                "reveal" => {
                    reveal = !reveal;
                    println!("Hidden thoughts {}", if reveal { "shown".green() } else { "hidden".yellow() });
                }
                "status" => {
                    println!(
                        "Affinity: {} ({}) / Scene: {}",
                        session.affinity(),
                        session.stage().label(),
                        session.scene.display_name()
                    );
                    if let Some(letter) = requests.status(&session.user_id, Utc::now(), &Local)? {
                        println!("Today's letter: {} [{}]", letter.theme, status_label(letter.status));
                    }
                }
                "reset" => {
                    session.reset();
                    println!("{}", "Conversation reset.".cyan());
                }
                "letter" => {
                    let hour = parts.next().and_then(|h| h.parse::<u32>().ok());
                    let theme = parts.next().unwrap_or_default();
                    match hour {
                        Some(hour) => match session.request_letter(&requests, theme, hour, Utc::now()) {
                            Ok(letter) => println!("{} {}", "Letter requested:".green(), letter.id),
                            Err(e) => println!("{} {}", "Letter request refused:".red(), e),
                        },
                        None => println!("Usage: /letter <hour> <theme>"),
                    }
                }
                "reflect" => match parts.next() {
                    Some(id) => match requests.read(id).map_err(anyhow::Error::from).and_then(|letter| {
                        session.reflect_letter(&letter)?;
                        Ok(letter)
                    }) {
                        Ok(letter) => println!("{} 「{}」", "Letter reflected:".green(), letter.theme.prompt_label()),
                        Err(e) => println!("{} {}", "Could not reflect letter:".red(), e),
                    },
                    None => println!("Usage: /reflect <letter-id>"),
                },
                other => println!("Unknown command: /{}", other),
            }
            continue;
        }

        match session.process_message(line, &engine).await {
            Ok(reply) => {
                if let Some(scene) = reply.new_scene {
                    println!("{} {}", format!("-- {} --", scene.display_name()).blue(), scene.background_url().dimmed());
                }
                println!("{}: {}", engine.persona().name.green(), render_reply(&reply.text, reveal));
                if let Some(change) = reply.change.filter(|c| c.delta != 0) {
                    let delta = format!("({:+} {})", change.delta, change.reason);
                    println!("{}", if change.delta > 0 { delta.green() } else { delta.red() });
                }
            }
            Err(e) => println!("{} {}", "⚠️".yellow(), e),
        }
    }

    Ok(())
}
