// cvar.rs — dynamic variable tracking

use crate::common::com_printf;

use std::collections::HashMap;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CvarFlags: u32 {
        /// Saved to the configuration file.
        const ARCHIVE = 1 << 0;
        /// Changes are announced to every connected client.
        const SERVER  = 1 << 1;
    }
}

/// A console variable.
#[derive(Debug, Clone)]
pub struct Cvar {
    pub name: String,
    pub string: String,
    pub default: String,
    pub flags: CvarFlags,
    pub value: f32,
}

/// The cvar registry. Owned by the host and passed by reference.
#[derive(Debug, Default)]
pub struct CvarContext {
    pub cvar_vars: Vec<Cvar>,
    cvar_index: HashMap<String, usize>,
    /// "name" changed to "value" notices for SERVER variables, drained by
    /// the server each frame and broadcast.
    pub server_notices: Vec<String>,
}

fn parse_value(s: &str) -> f32 {
    s.trim().parse::<f32>().unwrap_or(0.0)
}

impl CvarContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_var(&self, name: &str) -> Option<&Cvar> {
        self.cvar_index.get(name).map(|&idx| &self.cvar_vars[idx])
    }

    /// Floating-point value of a cvar, 0 if it does not exist.
    pub fn variable_value(&self, name: &str) -> f32 {
        self.find_var(name).map_or(0.0, |v| v.value)
    }

    /// String value of a cvar, "" if it does not exist.
    pub fn variable_string(&self, name: &str) -> &str {
        self.find_var(name).map_or("", |v| v.string.as_str())
    }

    /// Register a variable. Registering twice keeps the current value.
    pub fn register(&mut self, name: &str, value: &str, flags: CvarFlags) {
        if let Some(&idx) = self.cvar_index.get(name) {
            self.cvar_vars[idx].flags |= flags;
            return;
        }
        let idx = self.cvar_vars.len();
        self.cvar_vars.push(Cvar {
            name: name.to_string(),
            string: value.to_string(),
            default: value.to_string(),
            flags,
            value: parse_value(value),
        });
        self.cvar_index.insert(name.to_string(), idx);
    }

    /// Set a variable's value. Unknown names are reported and ignored.
    /// Returns true when the value actually changed.
    pub fn set(&mut self, name: &str, value: &str) -> bool {
        let Some(&idx) = self.cvar_index.get(name) else {
            com_printf(&format!("Cvar_Set: variable {} not found\n", name));
            return false;
        };
        let var = &mut self.cvar_vars[idx];
        if var.string == value {
            return false;
        }
        var.string = value.to_string();
        var.value = parse_value(value);
        if var.flags.contains(CvarFlags::SERVER) {
            self.server_notices
                .push(format!("\"{}\" changed to \"{}\"\n", name, value));
        }
        true
    }

    /// Set a variable from a float, printing integers without a fraction.
    pub fn set_value(&mut self, name: &str, value: f32) -> bool {
        let s = if value == (value as i32) as f32 {
            format!("{}", value as i32)
        } else {
            format!("{}", value)
        };
        self.set(name, &s)
    }

    /// Lines for the configuration file, one `name "value"` per archived cvar.
    pub fn archived_lines(&self) -> Vec<String> {
        self.cvar_vars
            .iter()
            .filter(|v| v.flags.contains(CvarFlags::ARCHIVE))
            .map(|v| format!("{} \"{}\"", v.name, v.string))
            .collect()
    }

    /// Take pending change notices for server variables.
    pub fn take_server_notices(&mut self) -> Vec<String> {
        std::mem::take(&mut self.server_notices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_keeps_existing_value() {
        let mut cvars = CvarContext::new();
        cvars.register("sv_gravity", "800", CvarFlags::SERVER);
        cvars.set("sv_gravity", "100");
        cvars.register("sv_gravity", "800", CvarFlags::empty());
        assert_eq!(cvars.variable_value("sv_gravity"), 100.0);
        assert_eq!(cvars.find_var("sv_gravity").map(|v| v.default.as_str()), Some("800"));
    }

    #[test]
    fn test_unknown_variable_reads_zero() {
        let cvars = CvarContext::new();
        assert_eq!(cvars.variable_value("nope"), 0.0);
        assert_eq!(cvars.variable_string("nope"), "");
    }

    #[test]
    fn test_server_variable_change_is_announced() {
        let mut cvars = CvarContext::new();
        cvars.register("sv_friction", "4", CvarFlags::SERVER);
        cvars.register("developer", "0", CvarFlags::empty());
        assert!(cvars.set("sv_friction", "6"));
        assert!(cvars.set("developer", "1"));
        assert!(!cvars.set("developer", "1"), "same value is not a change");
        let notices = cvars.take_server_notices();
        assert_eq!(notices, vec!["\"sv_friction\" changed to \"6\"\n".to_string()]);
        assert!(cvars.take_server_notices().is_empty());
    }

    #[test]
    fn test_set_value_formats_integers() {
        let mut cvars = CvarContext::new();
        cvars.register("skill", "1", CvarFlags::empty());
        cvars.set_value("skill", 3.0);
        assert_eq!(cvars.variable_string("skill"), "3");
        cvars.set_value("skill", 0.5);
        assert_eq!(cvars.variable_string("skill"), "0.5");
    }

    #[test]
    fn test_archived_lines() {
        let mut cvars = CvarContext::new();
        cvars.register("name", "player", CvarFlags::ARCHIVE);
        cvars.register("timeout", "60", CvarFlags::empty());
        assert_eq!(cvars.archived_lines(), vec!["name \"player\"".to_string()]);
    }
}
