use std::time::Duration;

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Config {
    pub app_name: String,
    pub app_version: String,
    pub app_lang: String,

    pub user_agent: String,

    /// How long to wait for a command round trip before giving up.
    pub command_timeout: Duration,
}

impl Config {
    /// Default command round-trip timeout.
    pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

    #[must_use]
    pub fn new() -> Self {
        let app_name = env!("CARGO_PKG_NAME").to_owned();
        let app_version = env!("CARGO_PKG_VERSION").to_owned();
        let app_lang = "en".to_owned();

        // Additional `User-Agent` string checks on top of `reqwest::HeaderValue`.
        let illegal_chars = |chr| chr == '/' || chr == ';';
        if app_name.is_empty()
            || app_name.contains(illegal_chars)
            || app_version.is_empty()
            || app_version.contains(illegal_chars)
            || app_lang.chars().count() != 2
            || app_lang.contains(illegal_chars)
        {
            panic!(
                "application name, version and/or language invalid (\"{app_name}\"; \"{app_version}\"; \"{app_lang}\")"
            );
        }

        let os_name = match std::env::consts::OS {
            "macos" => "osx",
            other => other,
        };
        let os_version = sysinfo::System::os_version().unwrap_or_else(|| String::from("0"));
        if os_name.is_empty()
            || os_name.contains(illegal_chars)
            || os_version.is_empty()
            || os_version.contains(illegal_chars)
        {
            panic!("os name and/or version invalid (\"{os_name}\"; \"{os_version}\")");
        }

        let user_agent =
            format!("{app_name}/{app_version} (Rust; {os_name}/{os_version}; {app_lang})");
        trace!("user agent: {user_agent}");

        Self {
            app_name,
            app_version,
            app_lang,

            user_agent,

            command_timeout: Self::COMMAND_TIMEOUT,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
