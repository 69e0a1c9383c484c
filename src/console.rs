//! Line-based keyboard input for the manual control loop.

use std::io::BufRead;

use tracing::{info, warn};

use crate::manual::{InputEvent, ManualHandle};

pub struct Console {
    manual: ManualHandle,
}

impl Console {
    pub fn new(manual: ManualHandle) -> Self {
        Self { manual }
    }

    pub fn print_help(&self, takeoff_altitude: f64) {
        info!("--- Keyboard Control Enabled ---");
        info!(" t: Takeoff to {:.1}m", takeoff_altitude);
        info!(" l: Land");
        info!(" g: Set GUIDED mode (needed for movement)");
        info!(" r: Return to launch");
        info!(" w/s/a/d: Move north/south/west/east");
        info!(" u/j: Move up/down");
        info!(" [/]: Yaw left/right");
        info!(" q: Quit");
    }

    /// Submits the inputs named on one line of input.
    ///
    /// A whole-line key name such as `up` wins; otherwise every character is
    /// read as a single key. Returns how many inputs were queued.
    pub fn feed_line(&self, line: &str) -> usize {
        let line = line.trim();
        if line.is_empty() {
            return 0;
        }
        let inputs: Vec<InputEvent> = match InputEvent::from_key(line) {
            Some(input) => vec![input],
            None => line
                .chars()
                .filter(|c| !c.is_whitespace())
                .filter_map(|c| {
                    let input = InputEvent::from_key(&c.to_string());
                    if input.is_none() {
                        warn!("[MANUAL] Unknown key '{}'", c);
                    }
                    input
                })
                .collect(),
        };

        let mut queued = 0;
        for input in inputs {
            match self.manual.submit_input(input) {
                Ok(()) => queued += 1,
                Err(e) => warn!("[MANUAL] {}", e),
            }
        }
        queued
    }

    /// Reads lines from `input` until it ends.
    ///
    /// Blocking, so it belongs on its own thread; the thread does not hold
    /// the runtime open at exit.
    pub fn run<R: BufRead>(&self, input: R) {
        for line in input.lines() {
            match line {
                Ok(line) => {
                    self.feed_line(&line);
                }
                Err(e) => {
                    warn!("Failed to read console input: {}", e);
                    return;
                }
            }
        }
        info!("Console input closed");
    }
}
