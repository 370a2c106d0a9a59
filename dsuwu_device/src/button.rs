//! The closed set of button names a producer may address.

/// Which byte (and bit) a button lives in on the wire.
///
/// `buttons1`/`buttons2` are the two packed bitmask bytes of the
/// button-response payload; `home`/`touch` are carried as separate bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ButtonName {
    // buttons1
    Share,
    L3,
    R3,
    Options,
    Up,
    Right,
    Down,
    Left,
    // buttons2
    L2,
    R2,
    L1,
    R1,
    Triangle,
    Circle,
    Cross,
    Square,
    // misc
    Home,
    Touch,
}

/// Classification of a [`ButtonName`] into the byte it contributes a bit to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonGroup {
    Mask1(u8),
    Mask2(u8),
    Home,
    Touch,
}

impl ButtonName {
    pub const ALL: [ButtonName; 18] = [
        ButtonName::Share,
        ButtonName::L3,
        ButtonName::R3,
        ButtonName::Options,
        ButtonName::Up,
        ButtonName::Right,
        ButtonName::Down,
        ButtonName::Left,
        ButtonName::L2,
        ButtonName::R2,
        ButtonName::L1,
        ButtonName::R1,
        ButtonName::Triangle,
        ButtonName::Circle,
        ButtonName::Cross,
        ButtonName::Square,
        ButtonName::Home,
        ButtonName::Touch,
    ];

    /// Maps each button to its wire bit.
    pub fn group(self) -> ButtonGroup {
        use ButtonGroup::*;
        use ButtonName::*;
        match self {
            Share => Mask1(0x01),
            L3 => Mask1(0x02),
            R3 => Mask1(0x04),
            Options => Mask1(0x08),
            Up => Mask1(0x10),
            Right => Mask1(0x20),
            Down => Mask1(0x40),
            Left => Mask1(0x80),

            L2 => Mask2(0x01),
            R2 => Mask2(0x02),
            L1 => Mask2(0x04),
            R1 => Mask2(0x08),
            Triangle => Mask2(0x10),
            Circle => Mask2(0x20),
            Cross => Mask2(0x40),
            Square => Mask2(0x80),

            Home => ButtonGroup::Home,
            Touch => ButtonGroup::Touch,
        }
    }
}

/// Builds a `buttons1` byte from a set of pressed [`ButtonName`]s.
///
/// Names outside `buttons1`'s group (i.e. not yielding `ButtonGroup::Mask1`)
/// are ignored.
pub fn buttons1_mask(pressed: impl IntoIterator<Item = ButtonName>) -> u8 {
    let mut mask = 0u8;
    for name in pressed {
        if let ButtonGroup::Mask1(bit) = name.group() {
            mask |= bit;
        }
    }
    mask
}

/// Builds a `buttons2` byte from a set of pressed [`ButtonName`]s.
pub fn buttons2_mask(pressed: impl IntoIterator<Item = ButtonName>) -> u8 {
    let mut mask = 0u8;
    for name in pressed {
        if let ButtonGroup::Mask2(bit) = name.group() {
            mask |= bit;
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_pack_matches_known_layout() {
        // share|options|up -> 0x19, triangle|cross -> 0x50
        let b1 = buttons1_mask([ButtonName::Share, ButtonName::Options, ButtonName::Up]);
        assert_eq!(b1, 0x19);
        let b2 = buttons2_mask([ButtonName::Triangle, ButtonName::Cross]);
        assert_eq!(b2, 0x50);
    }

    #[test]
    fn mixed_group_names_are_ignored_per_mask() {
        // Mask2-only names contribute nothing to a buttons1 mask.
        let b1 = buttons1_mask([ButtonName::Circle, ButtonName::Share]);
        assert_eq!(b1, 0x01);
    }
}
