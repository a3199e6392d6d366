//! Cheap-window membership. Windows are inclusive of `start`, exclusive
//! of `end`, evaluated against site local wall-clock time; `start > end`
//! wraps midnight.

use crate::state::CheapWindow;
use chrono::NaiveTime;

pub fn in_window(now: NaiveTime, window: &CheapWindow) -> bool {
    if window.start <= window.end {
        window.start <= now && now < window.end
    } else {
        now >= window.start || now < window.end
    }
}

pub fn in_any_window(now: NaiveTime, windows: &[CheapWindow]) -> bool {
    windows.iter().any(|w| in_window(now, w))
}
