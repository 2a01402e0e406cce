use anyhow::{anyhow, Result};
use std::io::{BufRead, Write};

/// Line-oriented question/answer over any reader and writer.
pub struct Prompter<'a> {
    input: &'a mut dyn BufRead,
    output: &'a mut dyn Write,
}

impl<'a> Prompter<'a> {
    pub fn new(input: &'a mut dyn BufRead, output: &'a mut dyn Write) -> Self {
        Self { input, output }
    }

    pub fn say(&mut self, message: impl AsRef<str>) -> Result<()> {
        writeln!(self.output, "{}", message.as_ref())?;
        Ok(())
    }

    fn read_answer(&mut self, prompt: &str) -> Result<String> {
        write!(self.output, "{}", prompt)?;
        self.output.flush()?;
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Err(anyhow!("input closed"));
        }
        Ok(line.trim().to_string())
    }

    pub fn line(&mut self, question: &str) -> Result<String> {
        self.say(question)?;
        self.read_answer("> ")
    }

    /// Numbered menu; returns the zero-based index of the choice.
    pub fn choose<S: AsRef<str>>(&mut self, title: &str, options: &[S]) -> Result<usize> {
        if options.is_empty() {
            return Err(anyhow!("nothing to choose for: {}", title));
        }
        self.say("")?;
        self.say(format!("=== {} ===", title))?;
        for (idx, option) in options.iter().enumerate() {
            self.say(format!("{}. {}", idx + 1, option.as_ref()))?;
        }
        let prompt = format!("Enter option (1-{}): ", options.len());
        loop {
            let answer = self.read_answer(&prompt)?;
            match answer.parse::<usize>() {
                Ok(choice) if (1..=options.len()).contains(&choice) => return Ok(choice - 1),
                _ => self.say(format!("Invalid choice, enter a number between 1 and {}", options.len()))?,
            }
        }
    }

    pub fn confirm(&mut self, question: &str) -> Result<bool> {
        self.say(question)?;
        loop {
            match self.read_answer("y/n: ")?.to_lowercase().as_str() {
                "y" | "yes" => return Ok(true),
                "n" | "no" => return Ok(false),
                _ => self.say("Please answer y or n")?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn choose_retries_until_valid() {
        let mut input = Cursor::new("0\nabc\n2\n");
        let mut output = Vec::new();
        let mut prompter = Prompter::new(&mut input, &mut output);
        let choice = prompter.choose("Backend", &["FlashAttention", "FlashInfer"]).unwrap();
        assert_eq!(choice, 1);
        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("=== Backend ==="));
        assert!(text.contains("2. FlashInfer"));
        assert_eq!(text.matches("Invalid choice").count(), 2);
    }

    #[test]
    fn confirm_accepts_words() {
        let mut input = Cursor::new("maybe\nYES\nno\n");
        let mut output = Vec::new();
        let mut prompter = Prompter::new(&mut input, &mut output);
        assert!(prompter.confirm("Continue?").unwrap());
        assert!(!prompter.confirm("Again?").unwrap());
    }

    #[test]
    fn closed_input_is_an_error() {
        let mut input = Cursor::new("");
        let mut output = Vec::new();
        let mut prompter = Prompter::new(&mut input, &mut output);
        assert!(prompter.line("Path?").is_err());
    }

    #[test]
    fn line_is_trimmed() {
        let mut input = Cursor::new("  /media/master  \n");
        let mut output = Vec::new();
        let mut prompter = Prompter::new(&mut input, &mut output);
        assert_eq!(prompter.line("Path?").unwrap(), "/media/master");
    }
}
