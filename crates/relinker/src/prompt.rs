use std::io::{self, BufRead, StdinLock, Stdout, Write};

use anyhow::{Context, Result, bail};

/// Line-oriented questions for first-run setup and missing arguments.
pub struct Prompter<R, W> {
    input: R,
    output: W,
}

impl Prompter<StdinLock<'static>, Stdout> {
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stdout())
    }
}

impl<R: BufRead, W: Write> Prompter<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    /// Ask once and return the trimmed answer, which may be empty.
    pub fn ask(&mut self, message: &str) -> Result<String> {
        write!(self.output, "{message}").context("failed to write prompt")?;
        self.output.flush().context("failed to flush prompt")?;
        let mut line = String::new();
        let read = self
            .input
            .read_line(&mut line)
            .context("failed to read answer")?;
        if read == 0 {
            bail!("input closed while waiting for: {}", message.trim());
        }
        Ok(line.trim().to_string())
    }

    pub fn ask_required(&mut self, message: &str) -> Result<String> {
        loop {
            let answer = self.ask(message)?;
            if !answer.is_empty() {
                return Ok(answer);
            }
        }
    }

    pub fn confirm(&mut self, message: &str) -> Result<bool> {
        let answer = self.ask(message)?.to_lowercase();
        Ok(answer == "y" || answer == "yes")
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::Prompter;

    #[test]
    fn ask_required_repeats_until_answered() {
        let mut output = Vec::new();
        let mut prompter = Prompter::new(Cursor::new("\n  \n theseed.io \n"), &mut output);
        assert_eq!(prompter.ask_required("domain: ").expect("answer"), "theseed.io");
        assert_eq!(String::from_utf8(output).expect("utf8"), "domain: ".repeat(3));
    }

    #[test]
    fn confirm_accepts_y_and_yes() {
        let mut prompter = Prompter::new(Cursor::new("Y\nyes\nn\n\n"), Vec::new());
        assert!(prompter.confirm("keep? ").expect("first"));
        assert!(prompter.confirm("keep? ").expect("second"));
        assert!(!prompter.confirm("keep? ").expect("third"));
        assert!(!prompter.confirm("keep? ").expect("fourth"));
    }

    #[test]
    fn closed_input_is_an_error() {
        let mut prompter = Prompter::new(Cursor::new(""), Vec::new());
        let error = prompter.ask_required("token: ").expect_err("must fail");
        assert!(error.to_string().contains("token:"));
    }
}
