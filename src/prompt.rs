//! The prompting primitive.
//!
//! Every question the installer asks goes through [`Prompter`]. The unattended
//! behaviour lives here and nowhere else: in unattended mode each prompt
//! returns its pre-supplied or default value without touching the console.
//! Once the confirmation checkpoint has passed the prompter is sealed and an
//! interactive prompt is an error instead of a blocking read.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::rc::Rc;

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal;

use crate::config::Secret;
use crate::error::{InstallError, Result};

/// Maximum attempts for a prompt whose answer is validated.
const MAX_ATTEMPTS: usize = 5;

/// Line-oriented terminal access.
pub trait Console {
    /// Show `prompt` and read one line (without the newline). EOF is an error.
    fn read_line(&mut self, prompt: &str) -> Result<String>;
    /// Like `read_line` but without echoing the typed characters.
    fn read_secret(&mut self, prompt: &str) -> Result<String>;
    fn write_line(&mut self, line: &str) -> Result<()>;
}

/// stdin for input, stderr for output; masked secret entry via raw mode.
#[derive(Debug, Default)]
pub struct TerminalConsole;

impl Console for TerminalConsole {
    fn read_line(&mut self, prompt: &str) -> Result<String> {
        let mut stderr = io::stderr();
        write!(stderr, "{}", prompt)?;
        stderr.flush()?;

        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line)? == 0 {
            return Err(InstallError::prompt("end of input"));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    fn read_secret(&mut self, prompt: &str) -> Result<String> {
        let mut stderr = io::stderr();
        write!(stderr, "{}", prompt)?;
        stderr.flush()?;

        terminal::enable_raw_mode()?;
        let entered = read_masked(&mut stderr);
        terminal::disable_raw_mode()?;
        writeln!(stderr)?;
        entered
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        writeln!(io::stderr(), "{}", line)?;
        Ok(())
    }
}

fn read_masked(out: &mut impl Write) -> Result<String> {
    let mut buf = String::new();
    loop {
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        match key.code {
            KeyCode::Enter => return Ok(buf),
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                return Err(InstallError::Aborted);
            }
            KeyCode::Backspace => {
                if buf.pop().is_some() {
                    write!(out, "\x08 \x08")?;
                }
            }
            KeyCode::Char(c) => {
                buf.push(c);
                write!(out, "*")?;
            }
            _ => {}
        }
        out.flush()?;
    }
}

#[derive(Debug, Default)]
struct Script {
    answers: VecDeque<String>,
    transcript: Vec<String>,
    reads: usize,
}

/// Replays canned answers and records everything shown. Clones share state,
/// so a test can keep a handle after giving one to the [`Prompter`].
#[derive(Debug, Clone, Default)]
pub struct ScriptedConsole {
    inner: Rc<RefCell<Script>>,
}

impl ScriptedConsole {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inner: Rc::new(RefCell::new(Script {
                answers: answers.into_iter().map(Into::into).collect(),
                ..Script::default()
            })),
        }
    }

    /// Prompts and lines written so far.
    pub fn transcript(&self) -> Vec<String> {
        self.inner.borrow().transcript.clone()
    }

    /// Number of reads (line or secret) performed.
    pub fn reads(&self) -> usize {
        self.inner.borrow().reads
    }

    pub fn remaining(&self) -> usize {
        self.inner.borrow().answers.len()
    }

    fn next(&mut self, prompt: &str) -> Result<String> {
        let mut script = self.inner.borrow_mut();
        script.transcript.push(prompt.to_string());
        script.reads += 1;
        script
            .answers
            .pop_front()
            .ok_or_else(|| InstallError::prompt(format!("no scripted answer for '{}'", prompt)))
    }
}

impl Console for ScriptedConsole {
    fn read_line(&mut self, prompt: &str) -> Result<String> {
        self.next(prompt)
    }

    fn read_secret(&mut self, prompt: &str) -> Result<String> {
        self.next(prompt)
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        self.inner.borrow_mut().transcript.push(line.to_string());
        Ok(())
    }
}

/// Whether prompts may block on the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    Interactive,
    Unattended,
}

pub struct Prompter {
    console: Box<dyn Console>,
    mode: PromptMode,
    sealed: bool,
}

impl Prompter {
    pub fn new(console: Box<dyn Console>, mode: PromptMode) -> Self {
        Self {
            console,
            mode,
            sealed: false,
        }
    }

    pub fn mode(&self) -> PromptMode {
        self.mode
    }

    pub fn is_unattended(&self) -> bool {
        self.mode == PromptMode::Unattended
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Forbid interactive input from now on.
    pub fn seal(&mut self) {
        self.sealed = true;
        tracing::debug!("prompter sealed");
    }

    /// Print an informational line. Never blocks.
    pub fn say(&mut self, line: &str) -> Result<()> {
        self.console.write_line(line)
    }

    fn ensure_open(&self, label: &str) -> Result<()> {
        if self.sealed {
            return Err(InstallError::prompt(format!(
                "'{}' asked after the confirmation checkpoint",
                label
            )));
        }
        Ok(())
    }

    /// Free-text answer. Empty input selects `default`.
    pub fn text(&mut self, label: &str, default: &str) -> Result<String> {
        self.text_validated(label, default, |_| Ok(()))
    }

    /// Free-text answer re-asked until `validate` accepts it.
    pub fn text_validated<F>(&mut self, label: &str, default: &str, validate: F) -> Result<String>
    where
        F: Fn(&str) -> std::result::Result<(), String>,
    {
        if self.is_unattended() {
            return Ok(default.to_string());
        }
        self.ensure_open(label)?;

        let prompt = if default.is_empty() {
            format!("{}: ", label)
        } else {
            format!("{} [{}]: ", label, default)
        };
        for _ in 0..MAX_ATTEMPTS {
            let answer = self.console.read_line(&prompt)?;
            let answer = answer.trim();
            let answer = if answer.is_empty() { default } else { answer };
            match validate(answer) {
                Ok(()) => return Ok(answer.to_string()),
                Err(reason) => self.console.write_line(&format!("  {}", reason))?,
            }
        }
        Err(InstallError::prompt(format!("no valid answer for '{}'", label)))
    }

    /// A credential. A pre-supplied value is used as is. Otherwise the user
    /// types it twice; unattended mode without a value is an error.
    pub fn secret(&mut self, label: &str, preset: Option<&Secret>) -> Result<Secret> {
        if let Some(secret) = preset.filter(|s| !s.is_empty()) {
            return Ok(secret.clone());
        }
        if self.is_unattended() {
            return Err(InstallError::prompt(format!(
                "{} is required in unattended mode (set ARCHSTRAP_PASSWORD)",
                label
            )));
        }
        self.ensure_open(label)?;

        for _ in 0..MAX_ATTEMPTS {
            let first = self.console.read_secret(&format!("{}: ", label))?;
            if first.is_empty() {
                self.console.write_line("  Value cannot be empty")?;
                continue;
            }
            if first.contains(char::is_whitespace) {
                self.console.write_line("  Value cannot contain whitespace")?;
                continue;
            }
            let second = self.console.read_secret(&format!("Repeat {}: ", label.to_lowercase()))?;
            if first == second {
                return Ok(Secret::new(first));
            }
            self.console.write_line("  Entries do not match")?;
        }
        Err(InstallError::prompt(format!("no valid answer for '{}'", label)))
    }

    /// A credential that may be left empty (an open network). Asked once.
    pub fn optional_secret(&mut self, label: &str) -> Result<Option<Secret>> {
        if self.is_unattended() {
            return Ok(None);
        }
        self.ensure_open(label)?;
        let value = self.console.read_secret(&format!("{} (empty for none): ", label))?;
        Ok(Some(Secret::new(value)).filter(|s| !s.is_empty()))
    }

    /// Yes/no question. Empty input selects `default`.
    pub fn confirm(&mut self, question: &str, default: bool) -> Result<bool> {
        if self.is_unattended() {
            return Ok(default);
        }
        self.ensure_open(question)?;

        let hint = if default { "[Y/n]" } else { "[y/N]" };
        for _ in 0..MAX_ATTEMPTS {
            let answer = self.console.read_line(&format!("{} {} ", question, hint))?;
            match answer.trim().to_ascii_lowercase().as_str() {
                "" => return Ok(default),
                "y" | "yes" => return Ok(true),
                "n" | "no" => return Ok(false),
                _ => self.console.write_line("  Please answer y or n")?,
            }
        }
        Err(InstallError::prompt(format!("no valid answer for '{}'", question)))
    }

    /// Pick one of `options` by number (1-based). Empty input selects `default`.
    pub fn select(&mut self, label: &str, options: &[String], default: usize) -> Result<usize> {
        if options.is_empty() {
            return Err(InstallError::prompt(format!("nothing to choose for '{}'", label)));
        }
        let default = default.min(options.len() - 1);
        if self.is_unattended() {
            return Ok(default);
        }
        self.ensure_open(label)?;

        self.console.write_line(&format!("{}:", label))?;
        for (i, option) in options.iter().enumerate() {
            self.console.write_line(&format!("  {}) {}", i + 1, option))?;
        }
        for _ in 0..MAX_ATTEMPTS {
            let answer = self.console.read_line(&format!("Choice [{}]: ", default + 1))?;
            let answer = answer.trim();
            if answer.is_empty() {
                return Ok(default);
            }
            match answer.parse::<usize>() {
                Ok(n) if (1..=options.len()).contains(&n) => return Ok(n - 1),
                _ => self
                    .console
                    .write_line(&format!("  Enter a number between 1 and {}", options.len()))?,
            }
        }
        Err(InstallError::prompt(format!("no valid answer for '{}'", label)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interactive(answers: &[&str]) -> (Prompter, ScriptedConsole) {
        let console = ScriptedConsole::new(answers.iter().copied());
        (Prompter::new(Box::new(console.clone()), PromptMode::Interactive), console)
    }

    fn unattended() -> (Prompter, ScriptedConsole) {
        let console = ScriptedConsole::default();
        (Prompter::new(Box::new(console.clone()), PromptMode::Unattended), console)
    }

    #[test]
    fn test_text_uses_default_on_empty_input() {
        let (mut p, _) = interactive(&["", "custom"]);
        assert_eq!(p.text("Hostname", "archstrap").unwrap(), "archstrap");
        assert_eq!(p.text("Hostname", "archstrap").unwrap(), "custom");
    }

    #[test]
    fn test_text_validated_reasks() {
        let (mut p, console) = interactive(&["1bad", "good"]);
        let answer = p
            .text_validated("Hostname", "", |v| {
                if v.starts_with(|c: char| c.is_ascii_digit()) {
                    Err("must start with a letter".to_string())
                } else {
                    Ok(())
                }
            })
            .unwrap();
        assert_eq!(answer, "good");
        assert_eq!(console.reads(), 2);
    }

    #[test]
    fn test_unattended_never_reads() {
        let (mut p, console) = unattended();
        assert_eq!(p.text("Hostname", "box").unwrap(), "box");
        assert!(p.confirm("Proceed?", true).unwrap());
        let options = vec!["/dev/sda".to_string(), "/dev/sdb".to_string()];
        assert_eq!(p.select("Disk", &options, 1).unwrap(), 1);
        assert_eq!(console.reads(), 0);
    }

    #[test]
    fn test_unattended_secret_requires_preset() {
        let (mut p, console) = unattended();
        assert!(matches!(p.secret("Password", None), Err(InstallError::Prompt(_))));

        let preset = Secret::new("pw");
        assert_eq!(p.secret("Password", Some(&preset)).unwrap(), preset);
        assert_eq!(console.reads(), 0);
    }

    #[test]
    fn test_sealed_prompter_refuses_interactive_input() {
        let (mut p, console) = interactive(&["answer"]);
        p.seal();
        assert!(matches!(p.text("Hostname", "x"), Err(InstallError::Prompt(_))));
        assert!(matches!(p.confirm("Again?", false), Err(InstallError::Prompt(_))));
        assert_eq!(console.reads(), 0);
        assert_eq!(console.remaining(), 1);
        // Output stays available
        p.say("still talking").unwrap();
    }

    #[test]
    fn test_sealed_unattended_still_returns_defaults() {
        let (mut p, _) = unattended();
        p.seal();
        assert_eq!(p.text("Locale", "en_US.UTF-8").unwrap(), "en_US.UTF-8");
    }

    #[test]
    fn test_secret_requires_matching_entries() {
        let (mut p, console) = interactive(&["one", "two", "pass", "pass"]);
        assert_eq!(p.secret("Password", None).unwrap().expose(), "pass");
        assert!(console.transcript().iter().any(|l| l.contains("do not match")));
    }

    #[test]
    fn test_confirm_parsing() {
        let (mut p, _) = interactive(&["maybe", "YES", "", "n"]);
        assert!(p.confirm("Proceed?", false).unwrap());
        assert!(!p.confirm("Proceed?", false).unwrap());
        assert!(!p.confirm("Proceed?", true).unwrap());
    }

    #[test]
    fn test_select_bounds() {
        let options = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let (mut p, _) = interactive(&["0", "4", "3", ""]);
        assert_eq!(p.select("Pick", &options, 0).unwrap(), 2);
        assert_eq!(p.select("Pick", &options, 1).unwrap(), 1);
    }

    #[test]
    fn test_exhausted_script_is_error() {
        let (mut p, _) = interactive(&[]);
        assert!(p.text("Anything", "").is_err());
    }
}
