// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Opcode, status and sense-key values from SPC-3 / SAM-5, plus the
//! mid-layer host-status codes reported alongside the device status.

// SCSI opcodes
/// Opcode for TEST UNIT READY command.
pub const TEST_UNIT_READY: u8 = 0x00;
/// Opcode for REQUEST SENSE command.
pub const REQUEST_SENSE: u8 = 0x03;
/// Opcode for READ(6) command.
pub const READ_6: u8 = 0x08;
/// Opcode for WRITE(6) command.
pub const WRITE_6: u8 = 0x0a;
/// Opcode for INQUIRY command.
pub const INQUIRY: u8 = 0x12;
/// Opcode for MODE SELECT(6) command.
pub const MODE_SELECT_6: u8 = 0x15;
/// Opcode for RESERVE(6) command.
pub const RESERVE_6: u8 = 0x16;
/// Opcode for RELEASE(6) command.
pub const RELEASE_6: u8 = 0x17;
/// Opcode for MODE SENSE(6) command.
pub const MODE_SENSE_6: u8 = 0x1a;
/// Opcode for START STOP UNIT command.
pub const START_STOP_UNIT: u8 = 0x1b;
/// Opcode for READ CAPACITY(10) command.
pub const READ_CAPACITY_10: u8 = 0x25;
/// Opcode for READ(10) command.
pub const READ_10: u8 = 0x28;
/// Opcode for WRITE(10) command.
pub const WRITE_10: u8 = 0x2a;
/// Opcode for VERIFY(10) command.
pub const VERIFY_10: u8 = 0x2f;
/// Opcode for SYNCHRONIZE CACHE(10) command.
pub const SYNCHRONIZE_CACHE_10: u8 = 0x35;
/// Opcode for READ(16) command.
pub const READ_16: u8 = 0x88;
/// Opcode for WRITE(16) command.
pub const WRITE_16: u8 = 0x8a;
/// Opcode for REPORT LUNS command.
pub const REPORT_LUNS: u8 = 0xa0;

// SAM status codes
/// The command completed without error.
pub const GOOD: u8 = 0x00;
/// Sense data has been delivered in the sense buffer.
pub const CHECK_CONDITION: u8 = 0x02;
/// The logical unit is busy.
pub const DEVICE_BUSY: u8 = 0x08;
/// The logical unit is reserved by another initiator.
pub const RESERVATION_CONFLICT: u8 = 0x18;
/// The task set of the logical unit is full.
pub const TASK_SET_FULL: u8 = 0x28;

// Host (mid-layer) status codes, carried in the upper half of a packed
// result status.
/// The low-level driver reported no problem.
pub const HOST_OK: u32 = 0x00;
/// The path could not reach the device at all.
pub const HOST_NO_CONNECT: u32 = 0x01;
/// The bus stayed busy through the allowed retries.
pub const HOST_BUS_BUSY: u32 = 0x02;
/// The command did not complete within its timeout.
pub const HOST_TIMEOUT: u32 = 0x03;
/// The addressed target did not respond.
pub const HOST_BAD_TARGET: u32 = 0x04;
/// The command was aborted on request.
pub const HOST_ABORT: u32 = 0x05;
/// A parity error was observed on the bus.
pub const HOST_PARITY: u32 = 0x06;
/// The driver or mid-layer failed the command internally.
pub const HOST_ERROR: u32 = 0x07;
/// The bus or device was reset while the command was in flight.
pub const HOST_RESET: u32 = 0x08;

// Sense keys
/// No specific sense data to report.
pub const NO_SENSE: u8 = 0x00;
/// The last command completed with recovery actions.
pub const RECOVERED_ERROR: u8 = 0x01;
/// The addressed logical unit cannot be accessed.
pub const NOT_READY: u8 = 0x02;
/// An error caused by a flaw in the medium or the recorded data.
pub const MEDIUM_ERROR: u8 = 0x03;
/// A non-recoverable hardware failure.
pub const HARDWARE_ERROR: u8 = 0x04;
/// An illegal request.
pub const ILLEGAL_REQUEST: u8 = 0x05;
/// A unit attention condition has been established.
pub const UNIT_ATTENTION: u8 = 0x06;
/// A write to a protected block was attempted.
pub const DATA_PROTECT: u8 = 0x07;
/// The device aborted the command.
pub const ABORTED_COMMAND: u8 = 0x0b;

// Additional sense codes of interest to the mid-layer.
/// LOGICAL UNIT NOT READY.
pub const ASC_NOT_READY: u8 = 0x04;
/// With [`ASC_NOT_READY`]: manual intervention is required to make the
/// logical unit ready.
pub const ASCQ_MANUAL_INTERVENTION: u8 = 0x03;
/// POWER ON, RESET, OR BUS DEVICE RESET OCCURRED.
pub const ASC_POWER_ON_RESET: u8 = 0x29;
/// Vendor hint that an array has reached quiescence.
pub const ASC_QUIESCENCE_ACHIEVED: u8 = 0x04;
/// Qualifier for [`ASC_QUIESCENCE_ACHIEVED`].
pub const ASCQ_QUIESCENCE_ACHIEVED: u8 = 0x22;

// Peripheral device types from the INQUIRY data.
/// Direct-access block device.
pub const TYPE_DISK: u8 = 0x00;
/// Sequential-access device.
pub const TYPE_TAPE: u8 = 0x01;
/// Processor device.
pub const TYPE_PROCESSOR: u8 = 0x03;
/// Write-once device.
pub const TYPE_WORM: u8 = 0x04;
/// CD/DVD device.
pub const TYPE_CDROM: u8 = 0x05;
/// Optical memory device.
pub const TYPE_OPTICAL: u8 = 0x07;
/// Medium changer device.
pub const TYPE_MEDIA_CHANGER: u8 = 0x08;
/// Storage array controller device.
pub const TYPE_RAID: u8 = 0x0c;

/// Byte size of the fixed-format sense buffer the mid-layer carries per
/// command.
pub const SENSE_BUFFER_SIZE: usize = 18;
