//! Loop-wide cached clock.

use std::time::{Instant, SystemTime};

/// Time as seen by the event loop, refreshed once per timer tick.
///
/// State machines read this instead of asking the OS, so every connection
/// handled during one tick agrees on "now" and on the `Date` header.
#[derive(Debug, Clone)]
pub struct Clock {
    pub now: Instant,
    pub wall: SystemTime,
    date: String,
}

impl Clock {
    pub fn new() -> Self {
        let wall = SystemTime::now();
        Self {
            now: Instant::now(),
            wall,
            date: httpdate::fmt_http_date(wall),
        }
    }

    pub fn tick(&mut self) {
        self.now = Instant::now();
        self.wall = SystemTime::now();
        self.date = httpdate::fmt_http_date(self.wall);
    }

    /// IMF-fixdate of the last tick.
    pub fn http_date(&self) -> &str {
        &self.date
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
