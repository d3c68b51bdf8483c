//! [`LedEcho`] – where LED changes are reported once they reach the toy.
//!
//! The strategy is chosen once, when the core is assembled, and called after
//! every successful `set_led`.

use rollbot_types::Rgb;

/// Receives the color the toy's main LED was just set to.
pub trait LedEcho: Send + Sync {
    fn echo(&self, color: Rgb);
}

/// Drops every echo.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEcho;

impl LedEcho for NoEcho {
    fn echo(&self, _color: Rgb) {}
}

impl<F> LedEcho for F
where
    F: Fn(Rgb) + Send + Sync,
{
    fn echo(&self, color: Rgb) {
        self(color)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn closure_echo_receives_color() {
        let seen = Mutex::new(Vec::new());
        let echo = |c: Rgb| seen.lock().unwrap().push(c);
        echo.echo(Rgb::new(1, 2, 3));
        assert_eq!(seen.lock().unwrap().as_slice(), &[Rgb::new(1, 2, 3)]);
    }

    #[test]
    fn no_echo_is_silent() {
        NoEcho.echo(Rgb::OFF);
    }
}
