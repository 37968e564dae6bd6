use url::Url;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub app_name: String,
    pub app_version: String,
    pub app_lang: String,

    pub device_name: String,
    pub device_id: Uuid,

    pub user_agent: String,

    /// Base URL of the identity backend (authorize/authenticate/refresh/logout).
    pub identity_url: Url,

    /// Base URL of the resource backend (profile API).
    pub resource_url: Url,
}

impl Config {
    /// Default identity backend, matching a local development deployment.
    const DEFAULT_IDENTITY_URL: &'static str = "http://localhost:8080";

    /// Default resource backend.
    const DEFAULT_RESOURCE_URL: &'static str = "http://localhost:8000";

    #[must_use]
    pub fn new() -> Self {
        let app_name = env!("CARGO_PKG_NAME").to_owned();
        let app_version = env!("CARGO_PKG_VERSION").to_owned();
        let app_lang = "en".to_owned();

        let device_id = match machine_uid::get() {
            Ok(machine_id) => {
                let namespace = Uuid::new_v5(&Uuid::NAMESPACE_DNS, b"advouch.app");
                Uuid::new_v5(&namespace, machine_id.as_bytes())
            }
            Err(e) => {
                warn!("could not get machine id, using random device id: {e}");
                *crate::uuid::Uuid::fast_v4()
            }
        };
        trace!("device uuid: {device_id}");

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
            format!("{app_name}/{app_version} (Rust; {os_name}/{os_version}; Headless; {app_lang})");
        trace!("user agent: {user_agent}");

        let identity_url = Url::parse(Self::DEFAULT_IDENTITY_URL).expect("invalid identity url");
        let resource_url = Url::parse(Self::DEFAULT_RESOURCE_URL).expect("invalid resource url");

        Self {
            device_name: app_name.clone(),

            app_name,
            app_version,
            app_lang,

            device_id,

            user_agent,

            identity_url,
            resource_url,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
