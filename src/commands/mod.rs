pub mod analyze;
pub mod analyze_all;
pub mod connect;
pub mod datstats;
pub mod vpinfo;

use std::error::Error;

use tracing::debug;

use crate::config::{ConfigError, ConfigTable};

pub type CommandResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Build the option table for a command. Unknown options, help requests and
/// empty required options print `usage` and yield `Ok(None)`.
pub fn parse_options<S: AsRef<str>>(
    defaults: &[(&'static str, &str)],
    required: &[&str],
    usage: &str,
    args: &[S],
) -> Result<Option<ConfigTable>, ConfigError> {
    let mut config = ConfigTable::new(defaults);
    let checked = config
        .load(args)
        .and_then(|()| required.iter().try_for_each(|key| config.required(key).map(drop)));
    match checked {
        Ok(()) => {
            for (key, value) in config.iter() {
                debug!("{} = {:?}", key, value);
            }
            Ok(Some(config))
        }
        Err(e) if e.wants_usage() => {
            debug!("Showing usage: {}", e);
            println!("{}", usage);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
