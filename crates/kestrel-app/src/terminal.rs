//! The text front end: prompt, read, execute, then act on whatever effect
//! came back.

use std::io::{BufRead, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

use kestrel_kernel::{Kernel, Outcome};
use kestrel_platform::Clock;
use kestrel_shell::Effect;
use kestrel_types::{Failure, KernelConfig};

const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";
const BELL: &str = "\x07";

/// What the loop does after a request.
enum Next {
    Continue,
    Reboot,
}

pub struct Terminal<R, W> {
    input: R,
    out: W,
    /// Kept for reboots.
    config: KernelConfig,
    clock: Arc<dyn Clock>,
}

impl<R: BufRead, W: Write> Terminal<R, W> {
    pub fn new(input: R, out: W, config: KernelConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            input,
            out,
            config,
            clock,
        }
    }

    /// Serve `kernel` until the input ends, then hand it back.
    pub fn run(&mut self, mut kernel: Kernel) -> Result<Kernel> {
        loop {
            write!(self.out, "{}", kernel.prompt())?;
            self.out.flush()?;
            let Some(line) = self.read_line()? else {
                writeln!(self.out)?;
                return Ok(kernel);
            };
            let next = self.submit(&mut kernel, &line)?;
            self.report_jobs(&mut kernel)?;
            if let Next::Reboot = next {
                kernel = self.reboot(kernel)?;
            }
        }
    }

    fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
    }

    /// Run one line, answering prompts until the kernel stops asking.
    fn submit(&mut self, kernel: &mut Kernel, line: &str) -> Result<Next> {
        if line.trim().is_empty() {
            return Ok(Next::Continue);
        }
        let mut result = kernel.execute(line);
        loop {
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(failure) => {
                    self.print_failure(&failure)?;
                    return Ok(Next::Continue);
                },
            };
            if !outcome.is_pending() {
                return self.show(outcome);
            }
            self.print_lines(&outcome.output)?;
            let Some(answers) = self.ask(&outcome.prompts)? else {
                return Ok(Next::Continue);
            };
            let Some(effect) = outcome.effect else {
                return Ok(Next::Continue);
            };
            result = kernel.resume(effect, answers);
        }
    }

    /// Collect one answer per prompt. `None` if the input ends first or
    /// there is nothing to ask.
    fn ask(&mut self, prompts: &[String]) -> Result<Option<Vec<String>>> {
        if prompts.is_empty() {
            return Ok(None);
        }
        let mut answers = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            write!(self.out, "{prompt} ")?;
            self.out.flush()?;
            match self.read_line()? {
                Some(answer) => answers.push(answer),
                None => {
                    writeln!(self.out)?;
                    return Ok(None);
                },
            }
        }
        Ok(Some(answers))
    }

    fn show(&mut self, outcome: Outcome) -> Result<Next> {
        let mut next = Next::Continue;
        match outcome.effect {
            Some(Effect::ClearScreen) => write!(self.out, "{CLEAR_SCREEN}")?,
            Some(Effect::Beep) => write!(self.out, "{BELL}")?,
            Some(Effect::Delay { millis }) => {
                self.out.flush()?;
                thread::sleep(Duration::from_millis(millis));
            },
            Some(Effect::LaunchApp { ref app, .. }) => {
                writeln!(self.out, "{app}: not available in the text terminal")?;
            },
            Some(Effect::Reboot) => next = Next::Reboot,
            _ => {},
        }
        self.print_lines(&outcome.output)?;
        Ok(next)
    }

    fn print_lines(&mut self, lines: &[String]) -> Result<()> {
        for line in lines {
            writeln!(self.out, "{line}")?;
        }
        self.out.flush()?;
        Ok(())
    }

    fn print_failure(&mut self, failure: &Failure) -> Result<()> {
        writeln!(self.out, "{}", failure.message)?;
        if let Some(hint) = &failure.suggestion {
            writeln!(self.out, "  {hint}")?;
        }
        Ok(())
    }

    /// Give every background job one step and print what happened.
    fn report_jobs(&mut self, kernel: &mut Kernel) -> Result<()> {
        for report in kernel.poll_jobs() {
            self.print_lines(&report.output)?;
            if let Some(failure) = &report.error {
                writeln!(self.out, "[{}] {}", report.id, failure.message)?;
            }
            if report.finished {
                writeln!(self.out, "[{}] Done", report.id)?;
            }
        }
        Ok(())
    }

    fn reboot(&mut self, kernel: Kernel) -> Result<Kernel> {
        writeln!(self.out, "Rebooting...")?;
        let storage = kernel.shutdown().context("could not save before reboot")?;
        let kernel = Kernel::boot(self.config.clone(), storage, Arc::clone(&self.clock))
            .context("reboot failed")?;
        log::info!("Rebooted");
        Ok(kernel)
    }
}
