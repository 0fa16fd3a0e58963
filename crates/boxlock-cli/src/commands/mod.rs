//! Mode dispatch and startup sequencing.

use boxlock_core::{
    alarm, ensure_lock_dirs, rescue, sandbox, Broker, BrokerConfig, IdentityError, SandboxTool,
};

use crate::cli::{self, Cli};
use crate::exit_codes;

mod free;
mod lock;

/// Runs the parsed invocation to completion and returns the exit code.
pub fn run(cli: &Cli) -> u8 {
    let mut broker = match setup() {
        Ok(broker) => broker,
        Err(code) => return code,
    };

    let (id_words, opts) = cli::split_trailing(&cli.args);
    for opt in opts {
        if let Err(error) = sandbox::validate_option(opt) {
            eprintln!("{error}");
            return exit_codes::INVALID_OPTION;
        }
    }

    let ids = match parse_box_ids(id_words, broker.config()) {
        Ok(ids) => ids,
        Err(code) => return code,
    };

    if cli.free {
        free::run(&mut broker, &ids, opts)
    } else {
        lock::run(&mut broker, &ids, opts, cli.count, cli.timeout, cli.noinit)
    }
}

/// Brings the broker up: state tree, host probe, identities, handlers.
fn setup() -> Result<Broker, u8> {
    let lock_root = BrokerConfig::resolve_lock_root();
    if let Err(error) = ensure_lock_dirs(&lock_root) {
        eprintln!("{error}");
        return Err(exit_codes::SETUP_FAILED);
    }

    let tool = SandboxTool::resolve();
    let info = tool.probe().map_err(|error| {
        eprintln!("{error}");
        exit_codes::SETUP_FAILED
    })?;

    let config = BrokerConfig::new(info.box_count, info.directory, lock_root);
    let broker = Broker::new(config, tool).map_err(|error| {
        eprintln!("{error}");
        match error {
            IdentityError::StatUnreadable { .. } => exit_codes::STAT_UNREADABLE,
            IdentityError::StatUnparsable { .. } => exit_codes::STAT_UNPARSABLE,
        }
    })?;

    // The rescue table must exist before any handler that consults it and
    // before the first acquisition can mark a box held.
    rescue::prepare(broker.config());
    if let Err(error) = alarm::install_alarm_handler().and_then(|()| rescue::install_fatal_handlers())
    {
        eprintln!("could not install signal handlers: {error}");
        return Err(exit_codes::SETUP_FAILED);
    }

    Ok(broker)
}

/// Parses and range-checks the box id words.
fn parse_box_ids(words: &[String], config: &BrokerConfig) -> Result<Vec<u32>, u8> {
    let mut ids = Vec::with_capacity(words.len());
    for word in words {
        let id: i64 = word.parse().map_err(|_| {
            eprintln!("{word} is an invalid box_id.");
            exit_codes::INVALID_BOX_ID
        })?;
        if !config.is_valid_box(id) {
            eprintln!("{id} is an invalid box_id.");
            return Err(exit_codes::INVALID_BOX_ID);
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        ids.push(id as u32);
    }
    Ok(ids)
}
