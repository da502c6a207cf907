//! Logical key names of a standard 105-key keyboard, indexed by XKB keycode.

use crate::combo::KEYCODE_OFFSET;

/// Returns the logical key at `xkb_keycode`, if it is one the capture side reports.
pub fn key_name(xkb_keycode: u32) -> Option<&'static str> {
    let name = match xkb_keycode {
        // Function row.
        67 => "F1",
        68 => "F2",
        69 => "F3",
        70 => "F4",
        71 => "F5",
        72 => "F6",
        73 => "F7",
        74 => "F8",
        75 => "F9",
        76 => "F10",
        95 => "F11",
        96 => "F12",
        // Number row.
        49 => "`",
        10 => "1",
        11 => "2",
        12 => "3",
        13 => "4",
        14 => "5",
        15 => "6",
        16 => "7",
        17 => "8",
        18 => "9",
        19 => "0",
        20 => "-",
        21 => "=",
        51 => "\\",
        // Upper row.
        24 => "q",
        25 => "w",
        26 => "e",
        27 => "r",
        28 => "t",
        29 => "y",
        30 => "u",
        31 => "i",
        32 => "o",
        33 => "p",
        34 => "[",
        35 => "]",
        // Home row.
        38 => "a",
        39 => "s",
        40 => "d",
        41 => "f",
        42 => "g",
        43 => "h",
        44 => "j",
        45 => "k",
        46 => "l",
        47 => ";",
        48 => "'",
        // Bottom row.
        52 => "z",
        53 => "x",
        54 => "c",
        55 => "v",
        56 => "b",
        57 => "n",
        58 => "m",
        59 => ",",
        60 => ".",
        61 => "/",
        // Other keys.
        22 => "BackSpace",
        119 => "Delete",
        116 => "Down",
        115 => "End",
        9 => "Escape",
        110 => "Home",
        118 => "Insert",
        113 => "Left",
        117 => "Page_Down",
        112 => "Page_Up",
        36 => "Return",
        114 => "Right",
        23 => "Tab",
        111 => "Up",
        65 => "space",
        _ => return None,
    };
    Some(name)
}

/// Same as [`key_name`], for a keycode as carried on the wire.
pub fn wire_key_name(keycode: u32) -> Option<&'static str> {
    key_name(keycode.checked_add(KEYCODE_OFFSET)?)
}
