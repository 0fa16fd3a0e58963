//! Lock mode: acquire boxes, print the grants, initialise the sandboxes.

use boxlock_core::Broker;
use tracing::debug;

use crate::exit_codes;

/// Acquires either the listed boxes or `count` arbitrary ones, prints each
/// granted id on its own line, and runs the sandbox init pass unless
/// suppressed. Exit 1 means nothing was granted.
pub fn run(
    broker: &mut Broker,
    ids: &[u32],
    opts: &[String],
    count: u32,
    timeout: f64,
    noinit: bool,
) -> u8 {
    if ids.is_empty() {
        let want = count as usize;
        match broker.acquire_any(want, timeout) {
            Err(error) => {
                eprintln!("{error}");
                broker.release_all_held();
                return exit_codes::UNAVAILABLE;
            }
            Ok(0) => {
                eprintln!("Insufficient isolate boxes available.");
                return exit_codes::UNAVAILABLE;
            }
            Ok(got) if got < want => {
                // The rollback itself failed; the caller gets the stragglers
                // rather than losing track of them.
                eprintln!(
                    "Could not acquire {count} locks, but could not release the {got} acquired locks."
                );
            }
            Ok(_) => {}
        }
    } else {
        match broker.acquire_listed(ids, timeout) {
            Err(error) => {
                eprintln!("{error}");
                broker.release_all_held();
                return exit_codes::UNAVAILABLE;
            }
            Ok(missing) => {
                for box_id in &missing {
                    eprintln!("Isolate box {box_id} unavailable.");
                }
                if broker.held().is_empty() {
                    return exit_codes::UNAVAILABLE;
                }
            }
        }
    }

    // Stdout carries nothing but the granted ids, in acquisition order.
    for box_id in broker.held() {
        println!("{box_id}");
    }

    if noinit {
        return exit_codes::SUCCESS;
    }
    // The boxes stay registered with the rescue table through this pass, so
    // a fatal signal mid-init still puts them back.
    for &box_id in broker.held() {
        debug!(box_id, "running sandbox init");
        match broker.tool().init_box(box_id, opts) {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                eprintln!(
                    "Lock acquired, but `{}` command failed.",
                    broker.tool().render_init_invocation(box_id, opts)
                );
                return exit_codes::INIT_FAILED;
            }
        }
    }
    exit_codes::SUCCESS
}
