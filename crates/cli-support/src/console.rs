use std::{
    cmp,
    io::{self, BufWriter, Write},
};

use crossterm::{style, QueueableCommand};

use odo_dev::DevEvent;

const ERROR_COLOR: style::Color = style::Color::Red;
const WARNING_COLOR: style::Color = style::Color::Yellow;
const PROGRESS_COLOR: style::Color = style::Color::DarkGreen;
const OUTPUT_COLOR: style::Color = style::Color::Blue;

pub struct ConsoleOptions {
    pub tty: bool,
}

/// Renders session events for a human on stderr
pub struct Console {
    options: ConsoleOptions,
    longest_container: usize,
}

impl Console {
    pub fn new(options: ConsoleOptions) -> Console {
        Console {
            options,
            longest_container: 0,
        }
    }

    pub fn push_event(&mut self, event: &DevEvent) {
        let mut stderr = BufWriter::with_capacity(32 * 1024, io::stderr());
        // Nowhere left to report a failing stderr.
        let _ = self.render(&mut stderr, event);
        let _ = stderr.flush();
    }

    pub fn error(&mut self, message: &str, hint: Option<&str>) {
        let mut stderr = BufWriter::new(io::stderr());
        let _ = self.render_error(&mut stderr, message, hint);
        let _ = stderr.flush();
    }

    pub fn render<W: Write>(&mut self, output: &mut W, event: &DevEvent) -> io::Result<()> {
        match event {
            DevEvent::Progress(message) => {
                self.marker(output, " • ", PROGRESS_COLOR)?;
                write!(output, "{}", message)?;
                self.newline(output)
            }
            DevEvent::Output { container, line } => {
                self.longest_container = cmp::max(self.longest_container, container.len());
                let padding = self.longest_container - container.len();
                self.marker(output, &format!("[{}{}]", " ".repeat(padding), container), OUTPUT_COLOR)?;
                write!(output, "{}", line.trim_end_matches(['\r', '\n']))?;
                self.newline(output)
            }
            DevEvent::Warning(message) => {
                self.marker(output, " ⚠ ", WARNING_COLOR)?;
                write!(output, "{}", message)?;
                self.newline(output)
            }
            DevEvent::Forwarded(ports) => {
                for port in ports {
                    self.marker(output, " - ", PROGRESS_COLOR)?;
                    write!(
                        output,
                        "Forwarding from {}:{} -> {}",
                        port.local_address, port.local_port, port.container_port
                    )?;
                    if port.is_debug {
                        write!(output, " (debug)")?;
                    }
                    self.newline(output)?;
                }
                Ok(())
            }
            DevEvent::Ready => {
                self.newline(output)?;
                self.marker(output, "↪ ", PROGRESS_COLOR)?;
                write!(
                    output,
                    "Dev mode: watching for changes in the current directory. Press Ctrl+c to exit and clean up, \
                     or p to push changes now."
                )?;
                self.newline(output)
            }
            DevEvent::Failed {
                message,
                hint,
                retry_in,
            } => {
                self.render_error(output, message, hint.as_deref())?;
                if let Some(delay) = retry_in {
                    write!(output, "   Retrying in {:.1}s", delay.as_secs_f64())?;
                    self.newline(output)?;
                }
                Ok(())
            }
            DevEvent::Stopping => {
                self.newline(output)?;
                self.marker(output, " • ", PROGRESS_COLOR)?;
                write!(output, "Cleaning resources, please wait")?;
                self.newline(output)
            }
        }
    }

    fn render_error<W: Write>(&mut self, output: &mut W, message: &str, hint: Option<&str>) -> io::Result<()> {
        self.marker(output, " ✗ ", ERROR_COLOR)?;
        let mut lines = message.lines();
        write!(output, "{}", lines.next().unwrap_or_default())?;
        self.newline(output)?;
        for line in lines {
            write!(output, "   {}", line)?;
            self.newline(output)?;
        }
        if let Some(hint) = hint {
            write!(output, "   Hint: {}", hint)?;
            self.newline(output)?;
        }
        Ok(())
    }

    fn marker<W: Write>(&self, output: &mut W, marker: &str, color: style::Color) -> io::Result<()> {
        if self.options.tty {
            output.queue(style::SetForegroundColor(color))?;
            write!(output, "{}", marker)?;
            output.queue(style::ResetColor)?;
            if !marker.ends_with(' ') {
                write!(output, " ")?;
            }
            Ok(())
        } else {
            let marker = marker.trim();
            write!(output, "{} ", marker)
        }
    }

    fn newline<W: Write>(&self, output: &mut W) -> io::Result<()> {
        // The key reader keeps the terminal in raw mode, which stops a bare newline from returning the carriage.
        if self.options.tty {
            output.write_all(b"\r\n")
        } else {
            output.write_all(b"\n")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use odo_session::ForwardedPort;

    use super::*;

    fn plain(events: &[DevEvent]) -> String {
        let mut console = Console::new(ConsoleOptions { tty: false });
        let mut output = Vec::new();
        for event in events {
            console.render(&mut output, event).unwrap();
        }
        String::from_utf8(output).unwrap()
    }

    #[test]
    fn output_lines_are_prefixed_and_aligned() {
        let rendered = plain(&[
            DevEvent::Output {
                container: "runtime".to_owned(),
                line: "listening\n".to_owned(),
            },
            DevEvent::Output {
                container: "db".to_owned(),
                line: "ready".to_owned(),
            },
        ]);
        assert_eq!(rendered, "[runtime] listening\n[     db] ready\n");
    }

    #[test]
    fn failures_show_hint_and_retry() {
        let rendered = plain(&[DevEvent::Failed {
            message: "command \"build\" exited with code 2:\nnpm ERR!".to_owned(),
            hint: Some("check the build command".to_owned()),
            retry_in: Some(Duration::from_millis(1500)),
        }]);
        assert_eq!(
            rendered,
            "✗ command \"build\" exited with code 2:\n   npm ERR!\n   Hint: check the build command\n   Retrying in 1.5s\n"
        );
    }

    #[test]
    fn forwards_listed_one_per_line() {
        let port = |local_port, container_port, is_debug| ForwardedPort {
            container_name: "web".to_owned(),
            local_address: "127.0.0.1".to_owned(),
            local_port,
            container_port,
            port_name: None,
            is_debug,
        };
        let rendered = plain(&[DevEvent::Forwarded(vec![port(20001, 3000, false), port(20002, 5858, true)])]);
        assert_eq!(
            rendered,
            "- Forwarding from 127.0.0.1:20001 -> 3000\n- Forwarding from 127.0.0.1:20002 -> 5858 (debug)\n"
        );
    }

    #[test]
    fn terminal_lines_end_with_carriage_return() {
        let mut console = Console::new(ConsoleOptions { tty: true });
        let mut output = Vec::new();
        console
            .render(&mut output, &DevEvent::Progress("Syncing files".to_owned()))
            .unwrap();
        let rendered = String::from_utf8(output).unwrap();
        assert!(rendered.ends_with("Syncing files\r\n"));
        assert!(rendered.contains('\u{1b}'));
    }
}
