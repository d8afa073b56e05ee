//! Interactive research session with readline support.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use crossterm::style::{Color, ResetColor, SetForegroundColor};
use crossterm::ExecutableCommand;
use rustyline::error::ReadlineError;
use rustyline::history::FileHistory;
use rustyline::{Config, Editor};
use tokio::sync::mpsc;

use qr_agent::{AgentState, ResearchAgent, TurnEvent};

/// One line of REPL input.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
    Blank,
    Message(String),
    Quit,
    Clear,
    Help,
    Report,
    Question,
    Resources,
    Analyze,
    Delete(String),
    Model(String),
    Unknown(String),
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    let Some(command) = line.strip_prefix('/') else {
        return if line.is_empty() {
            Input::Blank
        } else {
            Input::Message(line.to_string())
        };
    };

    let (name, arg) = command.split_once(char::is_whitespace).unwrap_or((command, ""));
    let arg = arg.trim().to_string();
    match name.to_ascii_lowercase().as_str() {
        "quit" | "exit" | "q" => Input::Quit,
        "clear" | "c" => Input::Clear,
        "help" | "?" => Input::Help,
        "report" | "r" => Input::Report,
        "question" => Input::Question,
        "resources" | "res" => Input::Resources,
        "analyze" => Input::Analyze,
        "delete" | "del" => Input::Delete(arg),
        "model" | "m" => Input::Model(arg),
        other => Input::Unknown(other.to_string()),
    }
}

fn show_or(text: &str, placeholder: &str) {
    if text.is_empty() {
        println!("{}\n", placeholder);
    } else {
        println!("\n{}\n", text);
    }
}

fn print_help() {
    println!(
        r#"
Research Commands:
  /help, /?          Show this help message
  /quit, /exit       Exit
  /clear, /c         Start a fresh session
  /report, /r        Show the current report
  /question          Show the research question
  /resources, /res   List collected resources
  /delete <url>      Remove a resource
  /analyze           Revise the report from the collected resources
  /model [name]      Show or switch the model

Tips:
  - Ask the assistant to search, draft a report, or refine your question
  - Press Ctrl+D to exit
  - Up/Down arrows navigate history
"#
    );
}

fn print_colored(color: Color, text: &str) -> io::Result<()> {
    let mut stdout = io::stdout();
    stdout.execute(SetForegroundColor(color))?;
    print!("{}", text);
    stdout.execute(ResetColor)?;
    println!();
    stdout.flush()
}

fn print_event(event: &TurnEvent) -> io::Result<()> {
    match event {
        TurnEvent::AssistantMessage { content } => {
            print_colored(Color::Cyan, &format!("assistant> {}\n", content))
        }
        TurnEvent::Log { message, done } => {
            let marker = if *done { "✓" } else { "…" };
            print_colored(Color::DarkGrey, &format!("  {} {}", marker, message))
        }
        TurnEvent::ResourcesAdded { resources } => {
            for resource in resources {
                print_colored(
                    Color::Green,
                    &format!("  + {} ({})", resource.title, resource.url),
                )?;
            }
            Ok(())
        }
        TurnEvent::ResourcesRemoved { urls } => {
            for url in urls {
                print_colored(Color::Yellow, &format!("  - {}", url))?;
            }
            Ok(())
        }
        TurnEvent::ReportUpdated { report } => print_colored(
            Color::Magenta,
            &format!("  [report updated, {} characters]", report.chars().count()),
        ),
        TurnEvent::ResearchQuestionUpdated { research_question } => print_colored(
            Color::Magenta,
            &format!("  [research question: {}]", research_question),
        ),
        TurnEvent::NodeEntered { .. } | TurnEvent::Finished { .. } => Ok(()),
    }
}

fn print_resources(state: &AgentState) {
    if state.resources.is_empty() {
        println!("No resources collected yet.\n");
        return;
    }
    println!();
    for (i, resource) in state.resources.iter().enumerate() {
        println!("{:>3}. {}", i + 1, resource.title);
        println!("     {}", resource.url);
    }
    println!();
}

/// Run one turn, printing progress events as they arrive.
async fn run_turn(agent: &ResearchAgent, state: &mut AgentState, text: &str) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let turn = async move {
        let result = agent.run_turn_with_events(state, text, None, Some(&tx)).await;
        drop(tx);
        result
    };
    let printer = async {
        while let Some(event) = rx.recv().await {
            let _ = print_event(&event);
        }
    };

    let (result, ()) = tokio::join!(turn, printer);
    let outcome = result?;
    tracing::debug!(
        model_calls = outcome.model_calls,
        reentries = outcome.reentries,
        "Turn complete"
    );
    Ok(())
}

/// Run interactive research mode
pub async fn run_chat(agent: Arc<ResearchAgent>, model: Option<String>) -> Result<()> {
    let models = agent.models();
    let model = model.unwrap_or_else(|| models.default_model().to_string());
    if !models.contains(&model) {
        anyhow::bail!("Unknown model '{}'. Available: {}", model, models.names().join(", "));
    }
    let mut state = AgentState::new().with_model(&model);

    let editor_config = Config::builder()
        .history_ignore_space(true)
        .history_ignore_dups(true)?
        .build();
    let mut rl: Editor<(), FileHistory> = Editor::with_config(editor_config)?;
    let history = history_file();
    if let Some(path) = &history {
        // Missing on first run
        let _ = rl.load_history(path);
    }

    println!(
        "Researching with model '{}'. Type /help for commands, /quit to exit.\n",
        state.model
    );

    loop {
        let line = match rl.readline("you> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Error reading input: {}", e);
                break;
            }
        };
        let _ = rl.add_history_entry(&line);

        match parse_input(&line) {
            Input::Blank => {}
            Input::Quit => break,
            Input::Help => print_help(),
            Input::Clear => {
                state = AgentState::new().with_model(&state.model);
                println!("Started a fresh session.\n");
            }
            Input::Report => show_or(&state.report, "No report yet."),
            Input::Question => show_or(&state.research_question, "No research question yet."),
            Input::Resources => print_resources(&state),
            Input::Delete(url) if url.is_empty() => println!("Usage: /delete <url>\n"),
            Input::Delete(url) => {
                let removed = state.remove_resources(std::slice::from_ref(&url));
                if removed.is_empty() {
                    println!("No resource with URL {}\n", url);
                } else {
                    println!("Removed {}\n", url);
                }
            }
            Input::Analyze => match agent.analyze(&mut state).await {
                Ok(()) => show_or(&state.report, "The analysis produced an empty report."),
                Err(e) => eprintln!("\nError: {}\n", e),
            },
            Input::Model(name) if name.is_empty() => println!(
                "Current model: {} (available: {})\n",
                state.model,
                models.names().join(", ")
            ),
            Input::Model(name) if models.contains(&name) => {
                state.model = name;
                println!("Switched to model '{}'.\n", state.model);
            }
            Input::Model(name) => println!("Unknown model: {}\n", name),
            Input::Unknown(name) => {
                eprintln!("Unknown command: /{}. Type /help for available commands.", name)
            }
            Input::Message(text) => {
                // A failed turn leaves the session as it was
                if let Err(e) = run_turn(&agent, &mut state, &text).await {
                    eprintln!("\nError: {}\n", e);
                }
            }
        }
    }

    println!("Goodbye!");
    if let Some(path) = &history {
        let _ = rl.save_history(path);
    }
    Ok(())
}

fn history_file() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("qr").join("chat_history"))
}
