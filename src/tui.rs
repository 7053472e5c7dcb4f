use crate::{ProgressDisplay, ProgressLine};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    style::{Color, Style, Stylize},
    text::Line,
    widgets::{Gauge, Paragraph, Widget},
    Terminal, TerminalOptions, Viewport,
};
use std::io::{self, Stdout};

/// Redraws one progress line in place and prints notes above it.
pub struct TerminalDisplay<B: Backend> {
    terminal: Terminal<B>,
    last: Option<ProgressLine>,
    finished: bool,
}

impl TerminalDisplay<CrosstermBackend<Stdout>> {
    pub fn stdout() -> io::Result<Self> {
        Self::new(CrosstermBackend::new(io::stdout()))
    }
}

impl<B: Backend> TerminalDisplay<B> {
    pub fn new(backend: B) -> io::Result<Self> {
        let terminal = Terminal::with_options(
            backend,
            TerminalOptions {
                viewport: Viewport::Inline(1),
            },
        )?;
        Ok(Self {
            terminal,
            last: None,
            finished: false,
        })
    }

    pub fn backend(&self) -> &B {
        self.terminal.backend()
    }

    fn print_above(&mut self, text: String) -> io::Result<()> {
        self.terminal.insert_before(1, |buf| {
            Paragraph::new(Line::from(text)).render(buf.area, buf);
        })
    }
}

impl<B: Backend> ProgressDisplay for TerminalDisplay<B> {
    fn render(&mut self, line: &ProgressLine) -> io::Result<()> {
        self.terminal.draw(|frame| match line {
            ProgressLine::Counter(text) => {
                frame.render_widget(Paragraph::new(text.as_str()).cyan(), frame.area());
            }
            ProgressLine::Bar { ratio, label } => {
                let gauge = Gauge::default()
                    .gauge_style(Style::default().fg(Color::Green).bg(Color::Black))
                    .ratio(ratio.clamp(0.0, 1.0))
                    .label(label.as_str());
                frame.render_widget(gauge, frame.area());
            }
        })?;
        self.last = Some(line.clone());
        Ok(())
    }

    fn note(&mut self, text: &str) -> io::Result<()> {
        self.print_above(text.to_string())
    }

    /// Keeps the last line as plain text and frees the viewport row.
    fn finish(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        if let Some(line) = self.last.take() {
            self.print_above(line.to_string())?;
        }
        self.terminal.clear()?;
        self.terminal.show_cursor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratatui::backend::TestBackend;

    fn screen(display: &TerminalDisplay<TestBackend>) -> String {
        display
            .backend()
            .buffer()
            .content()
            .iter()
            .map(|cell| cell.symbol())
            .collect()
    }

    #[test]
    fn counter_line_is_drawn() {
        let mut display = TerminalDisplay::new(TestBackend::new(80, 4)).unwrap();
        display
            .render(&ProgressLine::Counter("[   1.0s] samples/ch: 1,000".into()))
            .unwrap();
        assert!(screen(&display).contains("samples/ch: 1,000"));
    }

    #[test]
    fn bar_line_shows_its_label() {
        let mut display = TerminalDisplay::new(TestBackend::new(80, 4)).unwrap();
        display
            .render(&ProgressLine::Bar {
                ratio: 0.5,
                label: " 50% | elapsed   1.0s | ETA   1.0s".into(),
            })
            .unwrap();
        assert!(screen(&display).contains("50% | elapsed"));
    }

    #[test]
    fn notes_and_final_line_stay_on_screen() {
        let mut display = TerminalDisplay::new(TestBackend::new(80, 6)).unwrap();
        display.note("(…start of preview…)").unwrap();
        display
            .render(&ProgressLine::Counter("[   2.0s] samples/ch: 2,000".into()))
            .unwrap();
        display.finish().unwrap();
        display.finish().unwrap();

        let text = screen(&display);
        assert!(text.contains("start of preview"));
        assert_eq!(text.matches("samples/ch: 2,000").count(), 1);
    }
}
