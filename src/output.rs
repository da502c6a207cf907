//! A generated keymap able to type arbitrary text.
//!
//! Printable Latin-1 characters get a permanent place in the keymap. Any other
//! character is given one of the remaining (keycode, level) slots on demand; when all of
//! them are taken, slots are reused in the order they were handed out.

use crate::combo::{Combo, KEYCODE_OFFSET};
use std::{
    collections::{BTreeSet, HashMap},
    fmt::Write as _,
};
use xkbcommon::xkb;

/// Marks keymaps generated by this crate. The key is also bound to BackSpace.
pub const KEYMAP_TAG: &[u8] = b"<WKYS>";

/// Wire keycode of the tag key.
pub const BACKSPACE_KEYCODE: u32 = 0;

const KEYCODE_MAX: u32 = 255;
const KEYCODE_COUNT: usize = (KEYCODE_MAX - KEYCODE_OFFSET) as usize;
const LEVELS: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Slot {
    keycode: usize,
    level: usize,
}

impl Slot {
    fn combo(self) -> Combo {
        Combo {
            keycode: self.keycode as u32,
            // Level 2 is reached with Shift.
            mods: (1 << self.level) >> 1,
        }
    }
}

#[derive(Debug)]
struct ExtraSlot {
    slot: Slot,
    bound: Option<char>,
}

#[derive(Debug)]
pub struct OutputLayout {
    keymap: Vec<[Option<xkb::Keysym>; LEVELS]>,
    char_to_slot: HashMap<char, Slot>,
    extra: Vec<ExtraSlot>,
    next_extra: usize,
}

fn single(mut chars: impl Iterator<Item = char>) -> Option<char> {
    let c = chars.next()?;
    chars.next().is_none().then_some(c)
}

fn is_printable(c: char) -> bool {
    c == ' ' || !(c.is_control() || c.is_whitespace() || c == '\u{ad}')
}

fn printable_chars() -> BTreeSet<char> {
    (0..=0xffu32)
        .filter_map(char::from_u32)
        .flat_map(|c| [single(c.to_lowercase()), single(c.to_uppercase())])
        .flatten()
        .filter(|&c| is_printable(c))
        .collect()
}

impl Default for OutputLayout {
    fn default() -> OutputLayout {
        OutputLayout::new()
    }
}

impl OutputLayout {
    pub fn new() -> OutputLayout {
        let chars = printable_chars();
        let mut keymap = vec![[None; LEVELS]; KEYCODE_COUNT];
        let mut char_to_slot = HashMap::new();
        // Keycode 0 is the tag key.
        let mut next_keycode = 1;
        let mut half_used = None;

        let mut bind = |keymap: &mut Vec<[Option<xkb::Keysym>; LEVELS]>, c: char, slot: Slot| {
            keymap[slot.keycode][slot.level] = Some(xkb::utf32_to_keysym(c as u32));
            char_to_slot.insert(c, slot);
        };

        let mut assigned = BTreeSet::new();
        for &c in &chars {
            if assigned.contains(&c) {
                continue;
            }
            let lower = single(c.to_lowercase()).filter(|&l| l != c && chars.contains(&l));
            let upper = single(c.to_uppercase()).filter(|&u| u != c && chars.contains(&u));
            let pair = match (lower, upper) {
                (Some(lower), _) => Some((lower, c)),
                (None, Some(upper)) => Some((c, upper)),
                (None, None) => None,
            };
            match pair {
                Some((lower, upper)) => {
                    let keycode = next_keycode;
                    next_keycode += 1;
                    bind(&mut keymap, lower, Slot { keycode, level: 0 });
                    bind(&mut keymap, upper, Slot { keycode, level: 1 });
                    assigned.insert(lower);
                    assigned.insert(upper);
                }
                None => {
                    let slot = match half_used.take() {
                        Some(keycode) => Slot { keycode, level: 1 },
                        None => {
                            let keycode = next_keycode;
                            next_keycode += 1;
                            half_used = Some(keycode);
                            Slot { keycode, level: 0 }
                        }
                    };
                    bind(&mut keymap, c, slot);
                    assigned.insert(c);
                }
            }
        }

        let extra = (0..LEVELS)
            .flat_map(|level| (1..KEYCODE_COUNT).map(move |keycode| Slot { keycode, level }))
            .filter(|slot| keymap[slot.keycode][slot.level].is_none())
            .map(|slot| ExtraSlot { slot, bound: None })
            .collect();

        OutputLayout {
            keymap,
            char_to_slot,
            extra,
            next_extra: 0,
        }
    }

    /// Number of slots available to characters outside the static set.
    pub fn extra_capacity(&self) -> usize {
        self.extra.len()
    }

    pub fn lookup(&self, c: char) -> Option<Combo> {
        self.char_to_slot.get(&c).map(|slot| slot.combo())
    }

    /// The character that would lose its slot if `c` needed a new one.
    pub fn would_evict(&self, c: char) -> Option<char> {
        if self.char_to_slot.contains_key(&c) {
            return None;
        }
        self.extra[self.next_extra].bound
    }

    /// Returns the combo typing `c`, and whether the keymap had to change for it.
    pub fn char_to_combo(&mut self, c: char) -> (Combo, bool) {
        if let Some(combo) = self.lookup(c) {
            return (combo, false);
        }
        let index = self.next_extra;
        self.next_extra = (index + 1) % self.extra.len();
        let extra = &mut self.extra[index];
        if let Some(old) = extra.bound.replace(c) {
            self.char_to_slot.remove(&old);
        }
        let slot = extra.slot;
        self.keymap[slot.keycode][slot.level] = Some(xkb::utf32_to_keysym(c as u32));
        self.char_to_slot.insert(c, slot);
        (slot.combo(), true)
    }

    /// Returns whether the keymap changed, and the combos typing `text`.
    pub fn string_to_combos(&mut self, text: &str) -> (bool, Vec<Combo>) {
        let mut updated = false;
        let combos = text
            .chars()
            .map(|c| {
                let (combo, changed) = self.char_to_combo(c);
                updated |= changed;
                combo
            })
            .collect();
        (updated, combos)
    }

    /// Generates the XKB keymap for the current layout.
    ///
    /// Only the keycodes and symbols sections are spelled out; types and compatibility
    /// are included from "complete", which both Xwayland and wlroots compositors accept.
    pub fn to_xkb_def(&self) -> Vec<u8> {
        let tag = std::str::from_utf8(KEYMAP_TAG).unwrap_or_default();
        let mut keycodes = format!("{tag} = {KEYCODE_OFFSET};\n");
        let mut symbols = format!("key {tag} {{[BackSpace]}};\n");
        for (keycode, levels) in self.keymap.iter().enumerate() {
            let Some(last) = levels.iter().rposition(Option::is_some) else {
                continue;
            };
            let keysyms = levels[..=last]
                .iter()
                .map(|keysym| match keysym {
                    Some(keysym) => format!("{:#x}", keysym.raw()),
                    None => "NoSymbol".to_owned(),
                })
                .collect::<Vec<_>>()
                .join(", ");
            let xkb_keycode = KEYCODE_OFFSET + keycode as u32;
            _ = writeln!(keycodes, "<C{keycode}> = {xkb_keycode};");
            _ = writeln!(symbols, "key <C{keycode}> {{[{keysyms}]}};");
        }
        format!(
            "xkb_keymap {{\n\
             xkb_keycodes {{\n\
             minimum = {KEYCODE_OFFSET};\n\
             maximum = {maximum};\n\
             {keycodes}\
             }};\n\
             xkb_types {{ include \"complete\" }};\n\
             xkb_compatibility {{ include \"complete\" }};\n\
             xkb_symbols {{\n\
             {symbols}\
             }};\n\
             }};\n",
            maximum = KEYCODE_OFFSET + KEYCODE_COUNT as u32,
        )
        .into_bytes()
    }
}

/// Whether `keymap` was generated by [`OutputLayout::to_xkb_def`].
pub fn is_generated(keymap: &[u8]) -> bool {
    keymap
        .windows(KEYMAP_TAG.len())
        .any(|window| window == KEYMAP_TAG)
}
