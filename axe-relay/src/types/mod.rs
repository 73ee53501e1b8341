pub mod cooldown_alarm;
pub mod difficulty;

pub use cooldown_alarm::{AlarmStatus, CooldownAlarm};
pub use difficulty::{Difficulty, ParseDifficultyError};
