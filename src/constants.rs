//! Various certward-wide constants.

//------------ Binary Names -------------------------------------------------

/// The friendly name of the `certwardd` binary.
pub const CERTWARD_SERVER_APP: &str = "Certward";


//------------ Config Files Paths -------------------------------------------

/// The default path to the certward config file.
pub const CERTWARD_DEFAULT_CONFIG_FILE: &str = "/etc/certward.conf";


//------------ Environment Variables ----------------------------------------

/// The environment variable with the certward admin token.
///
/// Overrides the `admin_token` setting in the config file.
pub const CERTWARD_ENV_ADMIN_TOKEN: &str = "CERTWARD_ADMIN_TOKEN";

/// The environment variable with the log level.
///
/// The variable should contain the name of a [`log::LevelFilter`]. It will
/// be overwritten by the config file. The default is “info.”
pub const CERTWARD_ENV_LOG_LEVEL: &str = "CERTWARD_LOG_LEVEL";


//------------ Exchanges ----------------------------------------------------

/// The exchange lifecycle events are routed through.
pub const EVENT_EXCHANGE: &str = "certward-events";

/// The exchange per-caller reply queues are bound to.
pub const REPLY_EXCHANGE: &str = "certward-rpc";


//------------ Queues -------------------------------------------------------

/// The queue the enroll worker consumes.
pub const ENROLL_QUEUE: &str = "enroll";

/// The queue the collect worker consumes.
pub const COLLECT_QUEUE: &str = "collect";

/// The queue the renew worker consumes. Messages on this queue carry a
/// TTL so that stale renewal requests expire instead of being retried
/// forever.
pub const RENEW_QUEUE: &str = "renew";

/// The queue the revoke worker consumes.
pub const REVOKE_QUEUE: &str = "revoke";

/// The queue the reconciliation checker consumes.
pub const CHECK_QUEUE: &str = "check";

/// The queue the store command processor consumes.
pub const STORE_QUEUE: &str = "store-commands";


//------------ Identities ---------------------------------------------------

/// The identity the scheduler uses to derive its reply queue name.
pub const SCHEDULER_IDENTITY: &str = "scheduler";

/// The token subject claim granting full administrative access.
pub const ADMIN_IDENTITY: &str = "admin";


//------------ Wire format --------------------------------------------------

/// The content type carried on every bus message.
pub const CONTENT_TYPE_JSON: &str = "application/json";
