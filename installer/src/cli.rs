// Command-line flags
//
// Exactly two flags are recognised; anything else is ignored so wrappers can pass
// through extra arguments without breaking the installer.

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallArgs {
    /// `--reinstall`: wipe the installation directory and reconfigure.
    pub reinstall: bool,
    /// `--update`: pull new images and restart; no wizard, firewall or unit steps.
    pub update_only: bool,
}

impl InstallArgs {
    pub fn parse<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = Self::default();
        for arg in args {
            match arg.as_ref() {
                "--reinstall" => out.reinstall = true,
                "--update" => out.update_only = true,
                _ => {}
            }
        }
        out
    }

    /// Parse the current process arguments (program name skipped).
    pub fn from_env() -> Self {
        Self::parse(std::env::args().skip(1))
    }
}
