//! Interactive operator loop: one prompt per cycle, one command per line,
//! all aimed at the focused agent.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{ConsoleError, FocusError, HubError, RegistryError};
use crate::focus::{Failover, Focus};
use crate::ops;

/// One parsed operator line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Empty,
    /// List agents, or switch to the named one.
    Clients(Option<String>),
    Label(String),
    Cd(String),
    Get { remote: String, local: String },
    Put { local: String, remote: String },
    /// Anything else runs on the agent verbatim.
    Shell(String),
}

/// Parse one input line. Built-in command names are case-insensitive.
pub fn parse(line: &str) -> Result<Command, ConsoleError> {
    let mut words = split_words(line)?.into_iter();
    let Some(first) = words.next() else {
        return Ok(Command::Empty);
    };
    let mut arg = || words.next().ok_or(ConsoleError::InvalidArguments);

    let command = match first.to_lowercase().as_str() {
        "clients" => Command::Clients(arg().ok()),
        "label" => Command::Label(arg()?),
        "cd" => Command::Cd(arg()?),
        "get" => Command::Get {
            remote: arg()?,
            local: arg()?,
        },
        "put" => Command::Put {
            local: arg()?,
            remote: arg()?,
        },
        _ => Command::Shell(line.to_string()),
    };
    Ok(command)
}

/// Split a line into words the way a POSIX shell would: whitespace
/// separates, single quotes are literal, double quotes allow `\"` and `\\`,
/// and a bare backslash escapes the next character.
pub fn split_words(line: &str) -> Result<Vec<String>, ConsoleError> {
    let mut words = Vec::new();
    let mut word = String::new();
    // A word exists once any quote or character is seen, so `''` is a word.
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => word.push(c),
                        None => return Err(ConsoleError::Syntax),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\')) => word.push(c),
                            Some(c) => {
                                word.push('\\');
                                word.push(c);
                            }
                            None => return Err(ConsoleError::Syntax),
                        },
                        Some(c) => word.push(c),
                        None => return Err(ConsoleError::Syntax),
                    }
                }
            }
            '\\' => {
                in_word = true;
                word.push(chars.next().ok_or(ConsoleError::Syntax)?);
            }
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }
    if in_word {
        words.push(word);
    }
    Ok(words)
}

pub struct Console<R, W> {
    focus: Focus,
    input: R,
    output: W,
}

impl<R, W> Console<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(focus: Focus, input: R, output: W) -> Self {
        Self {
            focus,
            input,
            output,
        }
    }

    pub fn into_parts(self) -> (Focus, R, W) {
        (self.focus, self.input, self.output)
    }

    /// Prompt, read, dispatch until operator input ends.
    ///
    /// Fails only when every agent is gone or the console itself breaks.
    pub async fn run(&mut self) -> Result<(), HubError> {
        loop {
            if !self.sync_focus().await? {
                return Ok(());
            }

            let prompt = format!(
                "[{}] {}>> ",
                self.focus.label().unwrap_or_default(),
                self.focus.cwd().unwrap_or_default()
            );
            self.output.write_all(prompt.as_bytes()).await?;
            self.output.flush().await?;

            let Some(line) = self.read_line().await? else {
                return Ok(());
            };
            let command = match parse(&line) {
                Ok(command) => command,
                Err(err) => {
                    self.say(&err.to_string()).await?;
                    continue;
                }
            };

            if let Err(err) = self.dispatch(command).await? {
                if err.is_disconnect() {
                    debug!(error = %err, "focus lost during command");
                } else {
                    warn!(error = %err, "command failed");
                    self.say(&format!("Error: {err}")).await?;
                }
            }
        }
    }

    /// Refresh the focus's working directory, failing over as many times
    /// as needed. False when operator input ended while choosing an agent.
    async fn sync_focus(&mut self) -> Result<bool, HubError> {
        loop {
            match self.focus.refresh_cwd().await.map(|_| ()) {
                Ok(()) => return Ok(true),
                Err(err) if err.is_disconnect() || matches!(err, FocusError::NoFocus) => {
                    debug!(error = %err, "focus unusable");
                    if !self.replace_focus().await? {
                        return Ok(false);
                    }
                }
                Err(err) => {
                    // Slow or confused agent; keep the stale directory.
                    warn!(error = %err, "could not refresh working directory");
                    self.say(&format!("Error: {err}")).await?;
                    return Ok(true);
                }
            }
        }
    }

    async fn replace_focus(&mut self) -> Result<bool, HubError> {
        if self.focus.label().is_some() {
            self.say("Focus disconnected!").await?;
        }
        match self.focus.failover().await {
            Failover::Switched(label) => {
                self.say(&format!("Switched to {label}")).await?;
                Ok(true)
            }
            Failover::Ambiguous(_) => self.choose_focus().await,
            Failover::Exhausted => Err(HubError::NoAgents),
        }
    }

    /// Ask the operator which agent to focus next.
    async fn choose_focus(&mut self) -> Result<bool, HubError> {
        loop {
            let labels = self.focus.candidates().await;
            if labels.is_empty() {
                return Err(HubError::NoAgents);
            }
            self.say(&format!("Clients: {}", labels.join(", "))).await?;
            self.output.write_all(b"Choose a client: ").await?;
            self.output.flush().await?;

            let Some(line) = self.read_line().await? else {
                return Ok(false);
            };
            let choice = line.trim();
            if choice.is_empty() {
                continue;
            }
            match self.focus.switch(choice).await {
                Ok(_) => {
                    self.say(&format!("Client focus changed to {choice}!")).await?;
                    return Ok(true);
                }
                Err(_) => self.say("Client not found!").await?,
            }
        }
    }

    /// Run one command. The outer result is console I/O, the inner one the
    /// exchange with the agent.
    async fn dispatch(&mut self, command: Command) -> Result<Result<(), FocusError>, HubError> {
        let policy = self.focus.policy();
        match command {
            Command::Empty => {}
            Command::Clients(None) => {
                let current = self.focus.label().unwrap_or_default().to_string();
                let labels = self.focus.candidates().await;
                self.say(&format!("Current: {current}")).await?;
                self.say(&format!("Clients: {}", labels.join(", "))).await?;
            }
            Command::Clients(Some(label)) => match self.focus.switch(&label).await {
                Ok(_) => self.say(&format!("Client focus changed to {label}!")).await?,
                Err(_) => self.say("Client not found!").await?,
            },
            Command::Label(new) => match self.focus.relabel(&new).await {
                Ok(()) => self.say("New label added!").await?,
                Err(FocusError::Registry(RegistryError::DuplicateLabel(_))) => {
                    self.say("Label must be unique!").await?
                }
                Err(FocusError::Registry(RegistryError::EmptyLabel)) => {
                    self.say(&ConsoleError::InvalidArguments.to_string()).await?
                }
                Err(err) => return Ok(Err(err)),
            },
            Command::Cd(dir) => {
                let conn = match self.focus.resolve().await {
                    Ok(conn) => conn,
                    Err(err) => return Ok(Err(err)),
                };
                if let Err(err) = ops::change_dir(&conn, &dir, policy).await {
                    return Ok(Err(err.into()));
                }
            }
            Command::Get { remote, local } => {
                let conn = match self.focus.resolve().await {
                    Ok(conn) => conn,
                    Err(err) => return Ok(Err(err)),
                };
                match ops::fetch_file(&conn, &remote, policy).await {
                    Ok(Some(content)) => {
                        if let Err(err) = tokio::fs::write(&local, &content).await {
                            self.say(&format!("Could not write {local}: {err}")).await?;
                        } else {
                            self.say(&format!("Saved {} bytes to {local}", content.len()))
                                .await?;
                        }
                    }
                    Ok(None) => self.say("Remote file not found!").await?,
                    Err(err) => return Ok(Err(err.into())),
                }
            }
            Command::Put { local, remote } => {
                let content = match tokio::fs::read(&local).await {
                    Ok(content) => content,
                    Err(_) => {
                        self.say("File not found!").await?;
                        return Ok(Ok(()));
                    }
                };
                let conn = match self.focus.resolve().await {
                    Ok(conn) => conn,
                    Err(err) => return Ok(Err(err)),
                };
                if let Err(err) = ops::push_file(&conn, &remote, &content, policy).await {
                    return Ok(Err(err.into()));
                }
            }
            Command::Shell(line) => {
                let conn = match self.focus.resolve().await {
                    Ok(conn) => conn,
                    Err(err) => return Ok(Err(err)),
                };
                match ops::run_command(&conn, &line, policy).await {
                    Ok(out) => {
                        self.say(&format!("[Exit: {}]\n{}", out.exit_code, out.output))
                            .await?
                    }
                    Err(err) => return Ok(Err(err.into())),
                }
            }
        }
        Ok(Ok(()))
    }

    async fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        if self.input.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']).len();
        line.truncate(trimmed);
        Ok(Some(line))
    }

    async fn say(&mut self, text: &str) -> io::Result<()> {
        self.output.write_all(text.as_bytes()).await?;
        self.output.write_all(b"\n").await?;
        self.output.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Word splitting tests ────────────────────────────────────────

    #[test]
    fn splits_on_whitespace() {
        assert_eq!(split_words("  get  a\tb ").unwrap(), vec!["get", "a", "b"]);
        assert!(split_words("   ").unwrap().is_empty());
    }

    #[test]
    fn honours_quotes_and_escapes() {
        assert_eq!(
            split_words(r#"put 'my file.txt' "/tmp/a \"b\"" c\ d"#).unwrap(),
            vec!["put", "my file.txt", r#"/tmp/a "b""#, "c d"]
        );
        assert_eq!(split_words(r#"x"y"'z'"#).unwrap(), vec!["xyz"]);
        assert_eq!(split_words("label ''").unwrap(), vec!["label", ""]);
        assert_eq!(split_words(r#""a\nb""#).unwrap(), vec![r"a\nb"]);
    }

    #[test]
    fn rejects_unbalanced_input() {
        assert_eq!(split_words("echo 'oops"), Err(ConsoleError::Syntax));
        assert_eq!(split_words("echo \"oops"), Err(ConsoleError::Syntax));
        assert_eq!(split_words("echo oops\\"), Err(ConsoleError::Syntax));
    }

    // ── Command parsing tests ───────────────────────────────────────

    #[test]
    fn parses_builtins_case_insensitively() {
        assert_eq!(parse("").unwrap(), Command::Empty);
        assert_eq!(parse("CLIENTS").unwrap(), Command::Clients(None));
        assert_eq!(
            parse("clients beta").unwrap(),
            Command::Clients(Some("beta".into()))
        );
        assert_eq!(parse("Label web-1").unwrap(), Command::Label("web-1".into()));
        assert_eq!(parse("cd '/tmp/x y'").unwrap(), Command::Cd("/tmp/x y".into()));
        assert_eq!(
            parse("get /etc/hosts hosts.txt").unwrap(),
            Command::Get {
                remote: "/etc/hosts".into(),
                local: "hosts.txt".into()
            }
        );
        assert_eq!(
            parse("put local.bin /remote.bin").unwrap(),
            Command::Put {
                local: "local.bin".into(),
                remote: "/remote.bin".into()
            }
        );
    }

    #[test]
    fn missing_arguments() {
        for line in ["label", "cd", "get onlyone", "put", "put a"] {
            assert_eq!(parse(line), Err(ConsoleError::InvalidArguments), "{line}");
        }
    }

    #[test]
    fn other_lines_run_verbatim() {
        assert_eq!(
            parse("ls -la  'some dir'").unwrap(),
            Command::Shell("ls -la  'some dir'".into())
        );
        assert_eq!(parse("echo 'x"), Err(ConsoleError::Syntax));
    }
}
