//! Key names resolved against the host keymap.
//!
//! A [`ComboTable`] maps lowercase keysym names to the key that produces them on the
//! current host layout. It only knows about the first layout group and about keys that
//! produce a single keysym per level.

use crate::{
    error::{Error, Result},
    transport::KeyState,
};
use std::collections::HashMap;
use xkbcommon::xkb;

/// Difference between XKB keycodes and the keycodes carried on the wire.
pub(crate) const KEYCODE_OFFSET: u32 = 8;

/// A key and the modifier mask it contributes while held.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Combo {
    pub keycode: u32,
    pub mods: u32,
}

/// Names for the same keysym that older keymaps or users may spell differently.
const KEYSYM_ALIASES: &[&[&str]] = &[
    &["apostrophe", "quoteright"],
    &["f11", "l1"],
    &["f12", "l2"],
    &["f13", "l3"],
    &["f14", "l4"],
    &["f15", "l5"],
    &["f16", "l6"],
    &["f17", "l7"],
    &["f18", "l8"],
    &["f19", "l9"],
    &["f20", "l10"],
    &["f21", "r1"],
    &["f22", "r2"],
    &["f23", "r3"],
    &["f24", "r4"],
    &["f25", "r5"],
    &["f26", "r6"],
    &["f27", "r7"],
    &["f28", "r8"],
    &["f29", "r9"],
    &["f30", "r10"],
    &["f31", "r11"],
    &["f32", "r12"],
    &["f33", "r13"],
    &["f34", "r14"],
    &["f35", "r15"],
    &["grave", "quoteleft"],
    &["henkan", "henkan_mode"],
    &["kp_next", "kp_page_down"],
    &["kp_page_up", "kp_prior"],
    &["mae_koho", "previouscandidate"],
    &["mode_switch", "script_switch"],
    &["multiplecandidate", "zen_koho"],
    &["next", "page_down"],
    &["page_up", "prior"],
];

/// Side-less modifier names, bound to the left-hand key.
const MODIFIER_ALIASES: &[(&str, &[&str])] = &[
    ("alt_l", &["alt", "option"]),
    ("control_l", &["control"]),
    ("shift_l", &["shift"]),
    ("super_l", &["super", "windows", "command"]),
];

#[derive(Clone, Debug, Default)]
pub struct ComboTable {
    combos: HashMap<String, Combo>,
}

impl ComboTable {
    /// Builds the table from an XKB v1 text keymap, as sent by the compositor.
    pub fn from_keymap(keymap: &[u8]) -> Result<ComboTable> {
        let end = keymap.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        let keymap = &keymap[..end];
        if keymap.contains(&0) {
            return Err(Error::InvalidKeymap);
        }
        let text = std::str::from_utf8(keymap).map_err(|_| Error::InvalidKeymap)?;
        let context = xkb::Context::new(xkb::CONTEXT_NO_FLAGS);
        let keymap = xkb::Keymap::new_from_string(
            &context,
            text.to_owned(),
            xkb::KEYMAP_FORMAT_TEXT_V1,
            xkb::KEYMAP_COMPILE_NO_FLAGS,
        )
        .ok_or(Error::InvalidKeymap)?;
        Ok(ComboTable::from_xkb(&keymap))
    }

    fn from_xkb(keymap: &xkb::Keymap) -> ComboTable {
        let mut modifiers: HashMap<String, u32> = (0..keymap.num_mods().min(32))
            .map(|index| (keymap.mod_get_name(index).to_lowercase(), 1 << index))
            .collect();
        // Keymaps do not tell left and right modifiers apart.
        for name in ["alt", "control", "shift", "super"] {
            if let Some(&mask) = modifiers.get(name) {
                modifiers.insert(format!("{name}_l"), mask);
                modifiers.insert(format!("{name}_r"), mask);
            }
        }

        let mut combos = HashMap::new();
        let mut keysym_levels = HashMap::new();
        let min_keycode = keymap.min_keycode().raw();
        let max_keycode = keymap.max_keycode().raw();
        for raw_keycode in min_keycode..=max_keycode {
            let keycode = xkb::Keycode::new(raw_keycode);
            for level in 0..keymap.num_levels_for_key(keycode, 0) {
                let &[keysym] = keymap.key_get_syms_by_level(keycode, 0, level) else {
                    continue;
                };
                if keysym == xkb::Keysym::NoSymbol {
                    continue;
                }
                let name = xkb::keysym_get_name(keysym);
                if name.is_empty() {
                    continue;
                }
                let (name, alias) = match name.strip_prefix("XF86") {
                    Some(rest) => {
                        let alias = rest.to_lowercase();
                        (format!("xf86_{alias}"), Some(alias))
                    }
                    None => (name.to_lowercase(), None),
                };
                // Keep the first binding unless this keysym was seen before at a higher level.
                if combos.contains_key(&name)
                    && level >= keysym_levels.get(&keysym).copied().unwrap_or(0)
                {
                    continue;
                }
                let Some(wire_keycode) = raw_keycode.checked_sub(KEYCODE_OFFSET) else {
                    continue;
                };
                let combo = Combo {
                    keycode: wire_keycode,
                    mods: modifiers.get(&name).copied().unwrap_or(0),
                };
                if let Some(alias) = alias {
                    combos.insert(alias, combo);
                }
                combos.insert(name, combo);
                keysym_levels.insert(keysym, level);
            }
        }

        for &(name, aliases) in MODIFIER_ALIASES {
            if let Some(&combo) = combos.get(name) {
                for &alias in aliases {
                    combos.entry(alias.to_owned()).or_insert(combo);
                }
            }
        }
        for &group in KEYSYM_ALIASES {
            let Some(combo) = group.iter().find_map(|&name| combos.get(name).copied()) else {
                continue;
            };
            for &alias in group {
                combos.entry(alias.to_owned()).or_insert(combo);
            }
        }

        ComboTable { combos }
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<Combo> {
        self.combos.get(&name.to_lowercase()).copied()
    }

    pub fn len(&self) -> usize {
        self.combos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.combos.is_empty()
    }

    pub fn resolve(&self, combo: &KeyCombo) -> Result<Vec<(Combo, KeyState)>> {
        combo
            .steps()
            .iter()
            .map(|step| {
                self.get(&step.key)
                    .map(|combo| (combo, step.state))
                    .ok_or_else(|| Error::UnknownKey(step.key.clone()))
            })
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyStep {
    pub key: String,
    pub state: KeyState,
}

/// An already tokenized key combination: key names with press/release transitions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyCombo {
    steps: Vec<KeyStep>,
}

impl KeyCombo {
    pub fn new() -> KeyCombo {
        KeyCombo::default()
    }

    pub fn press(mut self, key: impl Into<String>) -> KeyCombo {
        self.steps.push(KeyStep {
            key: key.into(),
            state: KeyState::Pressed,
        });
        self
    }

    pub fn release(mut self, key: impl Into<String>) -> KeyCombo {
        self.steps.push(KeyStep {
            key: key.into(),
            state: KeyState::Released,
        });
        self
    }

    /// Presses every key in order, then releases them in reverse order.
    pub fn chord<I, S>(keys: I) -> KeyCombo
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        let presses = keys.iter().cloned().map(|key| KeyStep {
            key,
            state: KeyState::Pressed,
        });
        let releases = keys.iter().rev().cloned().map(|key| KeyStep {
            key,
            state: KeyState::Released,
        });
        presses.chain(releases).collect()
    }

    pub fn steps(&self) -> &[KeyStep] {
        &self.steps
    }
}

impl FromIterator<KeyStep> for KeyCombo {
    fn from_iter<T: IntoIterator<Item = KeyStep>>(iter: T) -> KeyCombo {
        KeyCombo {
            steps: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A self-contained keymap, `symbols` is spliced into the `xkb_symbols` section.
    pub(crate) fn test_keymap(symbols: &str) -> String {
        format!(
            r#"xkb_keymap {{
    xkb_keycodes "test" {{
        minimum = 8;
        maximum = 255;
        <ESC> = 9;
        <AE01> = 10;
        <LCTL> = 37;
        <AC01> = 38;
        <AC02> = 39;
        <TLDE> = 49;
        <LFSH> = 50;
        <FK11> = 95;
        <VOLU> = 123;
    }};
    xkb_types "test" {{
        virtual_modifiers NumLock;
        type "ONE_LEVEL" {{
            modifiers = none;
            level_name[Level1] = "Any";
        }};
        type "TWO_LEVEL" {{
            modifiers = Shift;
            map[Shift] = Level2;
            level_name[Level1] = "Base";
            level_name[Level2] = "Shift";
        }};
        type "ALPHABETIC" {{
            modifiers = Shift + Lock;
            map[Shift] = Level2;
            map[Lock] = Level2;
            level_name[Level1] = "Base";
            level_name[Level2] = "Caps";
        }};
    }};
    xkb_compatibility "test" {{
        interpret Any + AnyOf(all) {{
            action = SetMods(modifiers = modMapMods, clearLocks);
        }};
    }};
    xkb_symbols "test" {{
{symbols}
    }};
}};
"#
        )
    }

    pub(crate) const US_SYMBOLS: &str = r#"
        key <ESC> { [ Escape ] };
        key <AE01> { [ 1, exclam ] };
        key <LCTL> { [ Control_L ] };
        key <AC01> { [ a, A ] };
        key <AC02> { [ s, S ] };
        key <TLDE> { [ grave, asciitilde ] };
        key <LFSH> { [ Shift_L ] };
        key <FK11> { [ F11 ] };
        key <VOLU> { [ XF86AudioRaiseVolume ] };
        modifier_map Shift { <LFSH> };
        modifier_map Control { <LCTL> };
"#;

    fn table(symbols: &str) -> ComboTable {
        let mut keymap = test_keymap(symbols).into_bytes();
        keymap.push(0);
        ComboTable::from_keymap(&keymap).unwrap()
    }

    #[track_caller]
    fn check(table: &ComboTable, name: &str, keycode: u32, mods: u32) {
        assert_eq!(table.get(name), Some(Combo { keycode, mods }), "{name}");
    }

    #[test]
    fn test_basic_keys() {
        let table = table(US_SYMBOLS);
        check(&table, "escape", 1, 0);
        check(&table, "Escape", 1, 0);
        check(&table, "1", 2, 0);
        check(&table, "exclam", 2, 0);
        check(&table, "s", 31, 0);
        check(&table, "asciitilde", 41, 0);
        assert_eq!(table.get("b"), None);
    }

    #[test]
    fn test_lower_level_wins_for_both_names() {
        let table = table(US_SYMBOLS);
        check(&table, "a", 30, 0);
        check(&table, "A", 30, 0);
    }

    #[test]
    fn test_same_keysym_found_later_at_lower_level() {
        let table = table(
            r#"
        key <AC01> { [ b, x ] };
        key <AC02> { [ x ] };
"#,
        );
        check(&table, "b", 30, 0);
        check(&table, "x", 31, 0);
    }

    #[test]
    fn test_first_discovery_wins_across_keysyms() {
        // 'A' (level 1) claims the name "a" before 'a' (level 0) shows up on a later key.
        let table = table(
            r#"
        key <AC01> { [ c, A ] };
        key <AC02> { [ a ] };
"#,
        );
        check(&table, "a", 30, 0);
        check(&table, "c", 30, 0);
    }

    #[test]
    fn test_modifiers() {
        let table = table(US_SYMBOLS);
        check(&table, "shift_l", 42, 1);
        check(&table, "shift", 42, 1);
        check(&table, "control_l", 29, 4);
        check(&table, "control", 29, 4);
        assert_eq!(table.get("alt"), None);
    }

    #[test]
    fn test_aliases() {
        let table = table(US_SYMBOLS);
        check(&table, "f11", 87, 0);
        check(&table, "l1", 87, 0);
        check(&table, "grave", 41, 0);
        check(&table, "quoteleft", 41, 0);
        check(&table, "xf86_audioraisevolume", 115, 0);
        check(&table, "audioraisevolume", 115, 0);
        assert_eq!(table.get("f12"), None);
    }

    #[test]
    fn test_invalid_keymap() {
        assert!(matches!(
            ComboTable::from_keymap(b"xkb_keymap {"),
            Err(Error::InvalidKeymap)
        ));
        assert!(matches!(
            ComboTable::from_keymap(b"xkb\0keymap"),
            Err(Error::InvalidKeymap)
        ));
    }

    #[test]
    fn test_resolve() {
        let table = table(US_SYMBOLS);
        let steps = table.resolve(&KeyCombo::chord(["control", "a"])).unwrap();
        let control = Combo {
            keycode: 29,
            mods: 4,
        };
        let a = Combo {
            keycode: 30,
            mods: 0,
        };
        assert_eq!(
            steps,
            vec![
                (control, KeyState::Pressed),
                (a, KeyState::Pressed),
                (a, KeyState::Released),
                (control, KeyState::Released),
            ],
        );

        let err = table
            .resolve(&KeyCombo::new().press("hyper_l"))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownKey(name) if name == "hyper_l"));
    }
}
