//! Terminal geometry

use serde::{Deserialize, Serialize};

/// Window size in characters and pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowSize {
    /// Number of rows (characters)
    pub rows: u16,
    /// Number of columns (characters)
    pub cols: u16,
    /// Width in pixels (optional, can be 0)
    #[serde(default)]
    pub pixel_width: u16,
    /// Height in pixels (optional, can be 0)
    #[serde(default)]
    pub pixel_height: u16,
}

impl WindowSize {
    /// Create a new window size
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    /// Create a window size with pixel dimensions
    pub fn with_pixels(cols: u16, rows: u16, pixel_width: u16, pixel_height: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width,
            pixel_height,
        }
    }

    /// Both character dimensions are positive
    pub fn is_valid(&self) -> bool {
        self.rows > 0 && self.cols > 0
    }

    /// Convert to libc winsize structure
    #[cfg(unix)]
    pub fn to_winsize(&self) -> nix::libc::winsize {
        nix::libc::winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: self.pixel_width,
            ws_ypixel: self.pixel_height,
        }
    }

    /// Convert to a console coordinate, saturating at `i16::MAX`
    #[cfg(windows)]
    pub fn to_coord(&self) -> windows_sys::Win32::System::Console::COORD {
        windows_sys::Win32::System::Console::COORD {
            X: saturate_i16(self.cols),
            Y: saturate_i16(self.rows),
        }
    }
}

#[cfg(windows)]
fn saturate_i16(value: u16) -> i16 {
    i16::try_from(value).unwrap_or(i16::MAX)
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

impl std::fmt::Display for WindowSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

#[cfg(unix)]
impl From<nix::libc::winsize> for WindowSize {
    fn from(ws: nix::libc::winsize) -> Self {
        Self {
            rows: ws.ws_row,
            cols: ws.ws_col,
            pixel_width: ws.ws_xpixel,
            pixel_height: ws.ws_ypixel,
        }
    }
}
