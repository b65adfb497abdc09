//! Foliostats maintenance commands.
//!
//! The service itself runs embedded in its host application; this binary
//! carries the operational rim around it. Right now that is the `cleanup`
//! command, which removes expired entries from the response cache and is
//! meant to run once a day from cron.

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
