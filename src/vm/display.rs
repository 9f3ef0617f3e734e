//! Host display resolution probe.
//!
//! Supplied to [`crate::vm::command::CommandBuilder::build`] by the caller so
//! the builder itself never touches the environment.

use std::process::Command;

use tracing::debug;

/// Ask `xrandr` for the current screen size. Returns `None` when there is no
/// X display, `xrandr` is missing, or its output is unrecognised.
pub fn detect_resolution() -> Option<(u32, u32)> {
    let output = Command::new("xrandr").arg("--current").output().ok()?;
    if !output.status.success() {
        debug!(status = ?output.status, "xrandr failed");
        return None;
    }
    parse_xrandr(&String::from_utf8_lossy(&output.stdout))
}

/// Extract `current W x H` from the `Screen 0:` line of `xrandr` output.
pub fn parse_xrandr(text: &str) -> Option<(u32, u32)> {
    let line = text.lines().find(|l| l.starts_with("Screen "))?;
    let rest = &line[line.find("current ")? + "current ".len()..];
    let mut parts = rest.split(',').next()?.split('x');
    let width = parts.next()?.trim().parse().ok()?;
    let height = parts.next()?.trim().parse().ok()?;
    Some((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_screen_line() {
        let text = "Screen 0: minimum 320 x 200, current 1920 x 1080, maximum 16384 x 16384\n\
                    HDMI-1 connected primary 1920x1080+0+0\n";
        assert_eq!(parse_xrandr(text), Some((1920, 1080)));
    }

    #[test]
    fn garbage_yields_none() {
        assert_eq!(parse_xrandr("Can't open display"), None);
        assert_eq!(parse_xrandr("Screen 0: minimum 1 x 1"), None);
    }
}
