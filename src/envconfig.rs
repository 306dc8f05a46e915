use crate::errors::{Error, Result};
use std::collections::HashMap;
use std::ffi::{CString, OsString};
use std::os::unix::ffi::OsStrExt;

#[derive(Debug)]
enum Inherit {
    Remove(Vec<OsString>), // vars to remove (blacklist)
    None,                  // clear the environment
    Keep(Vec<OsString>),   // vars to keep (whitelist)
}

impl Default for Inherit {
    // Default to inheriting everything
    fn default() -> Self {
        Self::Remove(Vec::new())
    }
}

impl Inherit {
    fn clear(&mut self) {
        *self = Self::None;
    }

    fn remove(&mut self, k: impl Into<OsString>) {
        match self {
            Self::None | Self::Keep(_) => {
                *self = Self::Remove(vec![k.into()]);
            }
            Self::Remove(list) => list.push(k.into()),
        }
    }

    fn keep(&mut self, k: impl Into<OsString>) {
        match self {
            Self::None | Self::Remove(_) => {
                *self = Self::Keep(vec![k.into()]);
            }
            Self::Keep(list) => list.push(k.into()),
        }
    }

    fn vars(&self) -> HashMap<OsString, OsString> {
        let mut env = HashMap::new();
        match self {
            Self::None => (),
            Self::Remove(list) => {
                for (k, v) in std::env::vars_os() {
                    if !list.contains(&k) {
                        _ = env.insert(k, v);
                    }
                }
            }
            Self::Keep(list) => {
                for (k, v) in std::env::vars_os() {
                    if list.contains(&k) {
                        _ = env.insert(k, v);
                    }
                }
            }
        }
        env
    }
}

/// A realized child environment, in the `k=v` form handed to `execvpe`.
/// A process or pipeline without one inherits the parent environment
/// untouched.
pub type Environment = Vec<CString>;

/// Builds a child process environment: a policy for what the child inherits
/// from the parent, plus explicit variables layered on top.
///
/// Example:
/// ```no_run
/// # use pipework::{envconfig::EnvironmentBuilder, Pipeline};
/// let mut env = EnvironmentBuilder::new();
/// env.keep("HOME").keep("PATH").set("SERVER_PORT", "1234");
///
/// let status = Pipeline::new("env")
///     .env(env.realize().unwrap())
///     .status()
///     .unwrap();
/// ```
#[derive(Default)]
pub struct EnvironmentBuilder {
    inherit: Inherit,
    set: HashMap<OsString, OsString>,
}

impl EnvironmentBuilder {
    /// A builder with the policy of inheriting the parent's full
    /// environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the child with an empty environment. Note that the child
    /// executable is still located through the parent's `PATH`; set a
    /// `PATH` explicitly if the child itself needs one.
    pub fn clear(&mut self) -> &mut Self {
        self.inherit.clear();
        self
    }

    /// Sets a variable in the child environment, overriding an inherited
    /// value of the same name.
    pub fn set(&mut self, k: impl Into<OsString>, v: impl Into<OsString>) -> &mut Self {
        _ = self.set.insert(k.into(), v.into());
        self
    }

    /// Inherit only the named variables (whitelist policy). Consider
    /// keeping `PATH`.
    pub fn keep(&mut self, k: impl Into<OsString>) -> &mut Self {
        self.inherit.keep(k);
        self
    }

    /// Inherit everything except the named variables (blacklist policy).
    pub fn remove(&mut self, k: impl Into<OsString>) -> &mut Self {
        self.inherit.remove(k);
        self
    }

    /// Produces the [`Environment`] for [`Pipeline::env()`](crate::Pipeline::env).
    /// Usage error if a variable name contains `=` or either half contains
    /// a NUL byte.
    pub fn realize(&self) -> Result<Environment> {
        let mut env = self.inherit.vars();
        for (k, v) in &self.set {
            _ = env.insert(k.clone(), v.clone());
        }
        let mut vars = Vec::with_capacity(env.len());
        for (k, v) in env {
            if k.as_bytes().contains(&b'=') {
                return Err(Error::Usage("environment variable name contains '='"));
            }
            let mut buf = Vec::with_capacity(k.len() + v.len() + 1);
            buf.extend_from_slice(k.as_bytes());
            buf.push(b'=');
            buf.extend_from_slice(v.as_bytes());
            let var = CString::new(buf)
                .map_err(|_| Error::Usage("environment variable contains a NUL byte"))?;
            vars.push(var);
        }
        Ok(vars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contains(env: &Environment, entry: &str) -> bool {
        env.iter().any(|v| v.to_bytes() == entry.as_bytes())
    }

    #[test]
    fn cleared_environment_holds_only_explicit_sets() {
        let mut b = EnvironmentBuilder::new();
        b.clear().set("ONLY", "this");
        let env = b.realize().unwrap();
        assert_eq!(env.len(), 1);
        assert!(contains(&env, "ONLY=this"));
    }

    #[test]
    fn whitelist_keeps_named_vars() {
        std::env::set_var("PIPEWORK_ENV_TEST", "kept");
        let mut b = EnvironmentBuilder::new();
        b.keep("PIPEWORK_ENV_TEST");
        let env = b.realize().unwrap();
        assert_eq!(env.len(), 1);
        assert!(contains(&env, "PIPEWORK_ENV_TEST=kept"));
    }

    #[test]
    fn set_overrides_inherited_value() {
        std::env::set_var("PIPEWORK_ENV_OVERRIDE", "old");
        let mut b = EnvironmentBuilder::new();
        b.keep("PIPEWORK_ENV_OVERRIDE").set("PIPEWORK_ENV_OVERRIDE", "new");
        let env = b.realize().unwrap();
        assert!(contains(&env, "PIPEWORK_ENV_OVERRIDE=new"));
        assert!(!contains(&env, "PIPEWORK_ENV_OVERRIDE=old"));
    }

    #[test]
    fn bad_names_are_usage_errors() {
        let mut b = EnvironmentBuilder::new();
        b.clear().set("BAD=NAME", "x");
        assert!(matches!(b.realize().unwrap_err(), Error::Usage(_)));

        let mut b = EnvironmentBuilder::new();
        b.clear().set("NULBYTE", "a\0b");
        assert!(matches!(b.realize().unwrap_err(), Error::Usage(_)));
    }
}
