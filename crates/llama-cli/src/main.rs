use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::Parser;
use llama_cli::{build_config, generate, init_tracing, Chat, Overrides};
use llama_session::DEFAULT_MAX_TOKENS;

/// llama.rs — session-based text generation over the reference engine
#[derive(Parser)]
#[command(name = "llama-cli")]
struct Cli {
    /// JSON session config; flags override its values.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Generate a completion for a single prompt.
    Generate {
        /// Input prompt text.
        #[arg(short, long)]
        prompt: String,

        /// Maximum number of tokens to generate.
        #[arg(short = 'n', long, default_value_t = DEFAULT_MAX_TOKENS)]
        max_tokens: usize,
    },
    /// Interactive conversation. `/reset` starts over, `/quit` exits.
    Chat {
        /// Maximum number of tokens per reply.
        #[arg(short = 'n', long, default_value_t = DEFAULT_MAX_TOKENS)]
        max_tokens: usize,
    },
}

fn fail(e: impl std::fmt::Display) -> ! {
    eprintln!("error: {e}");
    std::process::exit(1);
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    let config = build_config(cli.config.as_deref(), &cli.overrides).unwrap_or_else(|e| fail(e));
    let stdout = io::stdout();

    match cli.command {
        Command::Generate { prompt, max_tokens } => {
            let mut out = stdout.lock();
            match generate(&config, &prompt, max_tokens, &mut out) {
                Ok(generation) => {
                    let _ = writeln!(out);
                    eprintln!(
                        "[{}] {} prompt / {} generated tokens, {:.1} tok/s",
                        generation.finish_reason,
                        generation.stats.prompt_tokens,
                        generation.stats.generated_tokens,
                        generation.stats.tokens_per_second
                    );
                }
                Err(e) => fail(e),
            }
        }
        Command::Chat { max_tokens } => {
            let mut chat = Chat::new(config, max_tokens).unwrap_or_else(|e| fail(e));
            let stdin = io::stdin();
            let mut out = stdout.lock();
            let _ = write!(out, "> ");
            let _ = out.flush();

            for line in stdin.lock().lines() {
                let line = line.unwrap_or_else(|e| fail(e));
                match line.trim() {
                    "" => {}
                    "/quit" => break,
                    "/reset" => {
                        chat.reset();
                        let _ = writeln!(out, "(conversation cleared)");
                    }
                    message => match chat.turn(message, &mut out) {
                        Ok(generation) => {
                            let _ = writeln!(out);
                            if generation.truncated {
                                eprintln!("(prompt truncated to fit the context)");
                            }
                        }
                        Err(e) => eprintln!("error: {e}"),
                    },
                }
                let _ = write!(out, "> ");
                let _ = out.flush();
            }
        }
    }
}
