use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Elapsed time in hundredths of a second.
pub struct DurationDisplay(u128);

pub trait DurationExt {
    fn display_duration(&self) -> DurationDisplay;
}

impl DurationExt for Duration {
    fn display_duration(&self) -> DurationDisplay {
        DurationDisplay((self.as_millis() + 5) / 10)
    }
}

impl Display for DurationDisplay {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let total_secs = self.0 / 100;
        let hours = total_secs / 3600;
        let rem = total_secs % 3600;
        let minutes = rem / 60;
        let seconds = rem % 60;
        let fraction = self.0 % 100;

        write!(f, "{}:{:02}:{:02}.{:02}", hours, minutes, seconds, fraction)
    }
}
