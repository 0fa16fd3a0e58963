//! Free mode: release boxes back to the pool.

use boxlock_core::Broker;

use crate::exit_codes;

/// Releases each listed box, printing the ids that went back. Releases are
/// independent: one refusal does not stop the rest, but any refusal turns
/// the exit code non-zero.
pub fn run(broker: &mut Broker, ids: &[u32], opts: &[String]) -> u8 {
    if ids.is_empty() {
        eprintln!("No box_id was specified - cannot free lock.");
        return exit_codes::NO_BOX_ID;
    }

    let mut failures = 0u32;
    for &box_id in ids {
        match broker.release(box_id, opts) {
            Ok(()) => println!("{box_id}"),
            Err(error) => {
                eprintln!("{error}");
                failures += 1;
            }
        }
    }

    if failures > 0 {
        exit_codes::UNAVAILABLE
    } else {
        exit_codes::SUCCESS
    }
}
