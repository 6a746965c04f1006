// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Synchronous command execution: issue, wait with a timeout, classify the
//! outcome, retry what is transient and abort what is stuck.

use std::time::Duration;
use std::time::Instant;

use log::info;
use log::warn;
use scsi_defs::ScsiResult;
use scsi_defs::ABORTED_COMMAND;
use scsi_defs::ASCQ_QUIESCENCE_ACHIEVED;
use scsi_defs::ASC_QUIESCENCE_ACHIEVED;
use scsi_defs::CHECK_CONDITION;
use scsi_defs::DATA_PROTECT;
use scsi_defs::DEVICE_BUSY;
use scsi_defs::HOST_ABORT;
use scsi_defs::HOST_BUS_BUSY;
use scsi_defs::HOST_ERROR;
use scsi_defs::HOST_NO_CONNECT;
use scsi_defs::HOST_RESET;
use scsi_defs::HOST_TIMEOUT;
use scsi_defs::NOT_READY;
use scsi_defs::RESERVATION_CONFLICT;
use scsi_defs::UNIT_ATTENTION;

use crate::command::Command;
use crate::core::ScsiCore;
use crate::issue;
use crate::issue::Delivery;
use crate::target::TARGET_NO_RETRY_ON_RESERV_CONFLICT;
use crate::Error;
use crate::Result;

/// Hard cap on attempts of one logical command, beyond the per-class retry
/// budgets.
const MAX_SYNC_ATTEMPTS: u32 = 64;
/// Attempts to abort a timed-out command before giving up on the device.
const ABORT_RETRIES: u32 = 5;

enum Verdict {
    Done(Result<ScsiResult>),
    Retry,
    RetrySleep(Duration),
    AbortAndRetry,
}

/// Issues `cmd` through `handle_id` and blocks until it resolves, retrying
/// transient outcomes.
///
/// Each attempt is bounded by the configured timeout; a firing timer aborts
/// the command on the device before the reissue. The whole loop is bounded
/// by `timeout * timeout_retries` of wall time and a hard attempt cap.
pub(crate) fn sync_execute(core: &ScsiCore, handle_id: u32, cmd: &Command) -> Result<ScsiResult> {
    let timeout = Duration::from_secs(core.options.timeout_secs.max(1));
    let wall_deadline = Instant::now() + timeout * core.options.timeout_retries.max(1);
    let mut timeouts_left = core.options.timeout_retries.max(1);
    let mut host_errors_left = core.options.host_error_retries;
    let mut reserv_left = core.options.reserv_conflict_retries;
    let mut self_aborts_left = core.options.timeout_retries.max(1);
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        if attempts > MAX_SYNC_ATTEMPTS {
            return Err(Error::Timeout);
        }
        let token = issue::execute(core, handle_id, cmd.clone(), Delivery::Wait)?;
        if token.wait_for_io_timeout(timeout) {
            warn!(
                "scsi: command serial {} timed out after {:?}",
                token.origin_sn, timeout
            );
            abort_timed_out_command(core, handle_id, token.origin_sn)?;
            timeouts_left -= 1;
            if timeouts_left == 0 || Instant::now() >= wall_deadline {
                return Err(Error::Timeout);
            }
            continue;
        }

        let result = token.result();
        if result.host_status() == HOST_ABORT {
            // A completion our own timeout handling aborted; the target is
            // treated as invalid once the retry budget is gone.
            if self_aborts_left == 0 {
                return Err(Error::InvalidTarget);
            }
            self_aborts_left -= 1;
        }
        match classify(
            core,
            handle_id,
            &result,
            attempts,
            &mut host_errors_left,
            &mut reserv_left,
        ) {
            Verdict::Done(outcome) => return outcome,
            Verdict::Retry => {}
            Verdict::RetrySleep(pause) => std::thread::sleep(pause),
            Verdict::AbortAndRetry => {
                abort_timed_out_command(core, handle_id, token.origin_sn)?;
            }
        }
        if Instant::now() >= wall_deadline {
            return Err(Error::Timeout);
        }
    }
}

fn classify(
    core: &ScsiCore,
    handle_id: u32,
    result: &ScsiResult,
    attempts: u32,
    host_errors_left: &mut u32,
    reserv_left: &mut u32,
) -> Verdict {
    if result.is_ok() {
        return Verdict::Done(Ok(*result));
    }
    let host = result.host_status();
    let device = result.device_status();
    let busy_sleep = Duration::from_millis(core.options.busy_sleep_ms);

    if device == RESERVATION_CONFLICT {
        let latched = core
            .lookup_handle(handle_id)
            .map(|h| h.target.inner.lock().flags & TARGET_NO_RETRY_ON_RESERV_CONFLICT != 0)
            .unwrap_or(true);
        if latched {
            return Verdict::Done(Err(Error::ReservationConflict));
        }
        if *reserv_left == 0 {
            // Give up and latch the target; a later successful read or
            // write clears the latch.
            if let Some(handle) = core.lookup_handle(handle_id) {
                handle.target.inner.lock().flags |= TARGET_NO_RETRY_ON_RESERV_CONFLICT;
            }
            return Verdict::Done(Err(Error::ReservationConflict));
        }
        *reserv_left -= 1;
        return Verdict::RetrySleep(Duration::from_millis(10 * attempts as u64));
    }

    match host {
        HOST_BUS_BUSY | HOST_RESET => return Verdict::RetrySleep(busy_sleep),
        HOST_TIMEOUT => return Verdict::AbortAndRetry,
        // A self-induced abort from our own timeout handling; the reissue
        // carries a fresh serial.
        HOST_ABORT => return Verdict::Retry,
        HOST_NO_CONNECT => return Verdict::Done(Err(Error::NoConnect)),
        HOST_ERROR => {
            if *host_errors_left > 0 {
                *host_errors_left -= 1;
                return Verdict::Retry;
            }
            return Verdict::Done(Err(Error::Io(result.status)));
        }
        _ => {}
    }

    if device == DEVICE_BUSY {
        return Verdict::RetrySleep(busy_sleep);
    }
    if device == CHECK_CONDITION {
        let sense = result.sense();
        return match sense.key {
            UNIT_ATTENTION => {
                if sense.asc == ASC_QUIESCENCE_ACHIEVED && sense.ascq == ASCQ_QUIESCENCE_ACHIEVED {
                    info!("scsi: array reports quiescence achieved");
                }
                if core.options.retry_unit_attention {
                    Verdict::Retry
                } else {
                    Verdict::Done(Err(Error::Io(result.status)))
                }
            }
            ABORTED_COMMAND => Verdict::Retry,
            NOT_READY => Verdict::Done(Err(Error::NotReady)),
            DATA_PROTECT => Verdict::Done(Err(Error::ReadOnly)),
            _ => Verdict::Done(Err(Error::Io(result.status))),
        };
    }
    Verdict::Done(Err(Error::Io(result.status)))
}

/// Aborts a command the waiter has given up on, retrying with backoff until
/// the abort lands or the device confirms nothing is running.
pub(crate) fn abort_timed_out_command(core: &ScsiCore, handle_id: u32, serial: u32) -> Result<()> {
    let handle = core.lookup_handle(handle_id).ok_or(Error::InvalidHandle)?;
    for attempt in 0..ABORT_RETRIES {
        match issue::do_abort(core, &handle, serial, false) {
            Ok(()) => return Ok(()),
            // Not running anywhere is as good as aborted.
            Err(Error::AbortNotRunning) => return Ok(()),
            Err(err) => {
                warn!(
                    "scsi: abort of serial {} attempt {} failed: {}",
                    serial,
                    attempt + 1,
                    err
                );
                std::thread::sleep(Duration::from_millis(10 * (attempt as u64 + 1)));
            }
        }
    }
    Err(Error::Timeout)
}
