#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEdge {
    Pressed,
    Released,
}

/// Turns raw key events for one designated key into press/release edges.
/// Auto-repeated key-downs while the key is held produce nothing.
#[derive(Debug, Clone)]
pub struct PushToTalk {
    key: String,
    pressed: bool,
}

impl PushToTalk {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            pressed: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_pressed(&self) -> bool {
        self.pressed
    }

    pub fn key_down(&mut self, key: &str) -> Option<KeyEdge> {
        if key != self.key || self.pressed {
            return None;
        }
        self.pressed = true;
        Some(KeyEdge::Pressed)
    }

    pub fn key_up(&mut self, key: &str) -> Option<KeyEdge> {
        if key != self.key || !self.pressed {
            return None;
        }
        self.pressed = false;
        Some(KeyEdge::Released)
    }

    pub fn reset(&mut self) {
        self.pressed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeats_are_ignored() {
        let mut ptt = PushToTalk::new("Space");
        assert_eq!(ptt.key_down("Space"), Some(KeyEdge::Pressed));
        assert_eq!(ptt.key_down("Space"), None);
        assert_eq!(ptt.key_down("Space"), None);
        assert_eq!(ptt.key_up("Space"), Some(KeyEdge::Released));
        assert_eq!(ptt.key_up("Space"), None);
    }

    #[test]
    fn other_keys_do_nothing() {
        let mut ptt = PushToTalk::new("Space");
        assert_eq!(ptt.key_down("KeyA"), None);
        assert_eq!(ptt.key_up("KeyA"), None);
        assert!(!ptt.is_pressed());
    }

    #[test]
    fn reset_forgets_held_key() {
        let mut ptt = PushToTalk::new("Space");
        ptt.key_down("Space");
        ptt.reset();
        assert_eq!(ptt.key_up("Space"), None);
        assert_eq!(ptt.key_down("Space"), Some(KeyEdge::Pressed));
    }
}
