//! AS monitor terminal wire format
//!
//! Byte markers the controller emits, command builders, and the 5-bit thread
//! mask used to address PC program threads. Markers are matched against the
//! tail of the receive buffer, so each one is the shortest byte sequence that
//! unambiguously ends the reply it stands for.

use std::fmt;

use crate::{KHIError, Result};

/// Default telnet port of a real controller
pub const KHI_TELNET_PORT: u16 = 23;
/// Default port of the K-ROSET simulator
pub const KROSET_PORT: u16 = 9105;

/// Number of PC program threads
pub const PC_THREADS: u8 = 5;

/// Login banner fragment
pub const LOGIN_BANNER: &[u8] = b"login";
/// Username accepted by the terminal
pub const LOGIN_USER: &str = "as";
/// "\r\n>" - terminal is ready for the next command
pub const PROMPT: &[u8] = b"\r\n>";

pub const LINE_END: &[u8] = b"\n";
pub const LINE_BREAK: &[u8] = b"\r\n";
pub const LOGIN_LINE_END: &[u8] = b"\r\n";

// Program loading dialog
pub const START_LOADING: &[u8] = b"LOAD using.rcc\r\n\x02\x41    \x30\x17";
pub const LOADING_ACCEPTED: &[u8] = b"Loading...(using.rcc)\r\n";
/// End of "SAVE/LOAD in progress." - a previous dialog was never closed
pub const SAVE_LOAD_IN_PROGRESS: &[u8] = b"ess.\r\n>";
pub const BATCH_PREFIX: &[u8] = b"\x02\x43    \x30";
pub const BATCH_SUFFIX: &[u8] = b"\x17";
/// Payload that closes a dangling SAVE/LOAD dialog
pub const END_OF_FILE: &[u8] = b"END.";
/// Payload of the sentinel batch that ends the transmission
pub const END_OF_LOAD: &[u8] = b"\x1a\x17\x02\x45    \x30";
pub const BATCH_ACCEPTED: &[u8] = b"\x05\x02\x43\x17";
pub const HARD_ABORT: &[u8] = b"\x05\x02\x45\x17";
pub const SYNTAX_ERROR: &[u8] =
    b"\r\nSTEP syntax error.\r\n(0:Change to comment and continue, 1:Delete program and abort)\r\n";
/// End of "File load completed. (<N> errors)" followed by the prompt
pub const TRANSMISSION_TALLY: &[u8] = b"s)\r\n>";

/// "Are you sure ? (Yes:1, No:0) "
pub const CONFIRMATION_REQUEST: &[u8] = b"0) ";
pub const CONFIRM_YES: &str = "1";
pub const COMMENT_AND_CONTINUE: &str = "0";
pub const DELETE_AND_ABORT: &str = "1";

// Rejections
pub const PROG_NOT_EXIST: &[u8] = b"Program does not exist.";
pub const PROGRAM_IN_USE: &[u8] = b"already in use.";
pub const PROG_IS_LOADED: &[u8] = b"KILL or PCKILL to delete program.";
pub const PROG_IS_ACTIVE: &[u8] = b"Cannot KILL program that is running.";
pub const THREAD_IS_BUSY: &[u8] = b"PC program is running.";
pub const TEACH_MODE_ON: &[u8] = b"program in TEACH mode.";
pub const TEACH_LOCK_ON: &[u8] = b"teach lock is ON.";
pub const MOTORS_DISABLED: &[u8] = b"motor power is OFF.";
pub const VAR_NOT_DEFINED: &[u8] = b"Variable is not defined.";
pub const VALUE_OUT_OF_RANGE: &str = "Value is out of range.";

// RCP terminal states
pub const PROGRAM_COMPLETED: &[u8] = b"Program completed.No = 1";
pub const PROGRAM_ABORTED: &[u8] = b"Program aborted.No = 1";
pub const PROGRAM_HELD: &[u8] = b"Program held.No = 1";
pub const NO_WORK_DETECTED: &[u8] = b"(E6509) No work detected";

pub fn pc_status(thread: u8) -> String {
    format!("PCSTATUS {}:", thread)
}

pub fn pc_execute(thread: u8, program: &str) -> String {
    format!("PCEXE {}: {}", thread, program)
}

pub fn pc_abort(thread: u8) -> String {
    format!("PCABORT {}:", thread)
}

pub fn pc_end(thread: u8) -> String {
    format!("PCEND {}:", thread)
}

pub fn pc_kill(thread: u8) -> String {
    format!("PCKILL {}:", thread)
}

pub fn execute(program: &str) -> String {
    format!("EXECUTE {}", program)
}

pub fn switch(name: &str) -> String {
    format!("SWITCH {}", name)
}

pub fn set_switch(name: &str, on: bool) -> String {
    format!("SWITCH {} {}", name, if on { "ON" } else { "OFF" })
}

pub fn delete_program(program: &str) -> String {
    format!("DELETE/P/D {}", program)
}

pub fn list_real(variable: &str) -> String {
    format!("list /r {}", variable)
}

/// Wraps a payload into an upload batch frame
pub fn frame_batch(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(BATCH_PREFIX.len() + payload.len() + BATCH_SUFFIX.len());
    frame.extend_from_slice(BATCH_PREFIX);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(BATCH_SUFFIX);
    frame
}

/// Returns true when `marker` occurs anywhere in `haystack`
pub fn contains(haystack: &[u8], marker: &[u8]) -> bool {
    !marker.is_empty() && haystack.windows(marker.len()).any(|w| w == marker)
}

/// Printable rendering of raw terminal bytes for logs
pub fn escape(bytes: &[u8]) -> String {
    bytes.escape_ascii().to_string()
}

/// Execution slot of a program on the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Pc(u8),
    Rcp,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Pc(thread) => write!(f, "PC thread {}", thread),
            Slot::Rcp => write!(f, "the robot control program slot"),
        }
    }
}

/// Set of PC threads packed into 5 bits, bit 0 is thread 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThreadMask(u8);

impl ThreadMask {
    pub const ALL: ThreadMask = ThreadMask(0b1_1111);

    pub fn empty() -> Self {
        ThreadMask(0)
    }

    pub fn from_bits(bits: u8) -> Self {
        ThreadMask(bits & Self::ALL.0)
    }

    pub fn single(thread: u8) -> Result<Self> {
        Self::from_threads(&[thread])
    }

    pub fn from_threads(threads: &[u8]) -> Result<Self> {
        threads.iter().try_fold(ThreadMask(0), |mask, &thread| {
            if !(1..=PC_THREADS).contains(&thread) {
                return Err(KHIError::InvalidThread(thread));
            }
            Ok(mask.with(thread))
        })
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn with(self, thread: u8) -> Self {
        if (1..=PC_THREADS).contains(&thread) {
            ThreadMask(self.0 | 1 << (thread - 1))
        } else {
            self
        }
    }

    pub fn contains(self, thread: u8) -> bool {
        (1..=PC_THREADS).contains(&thread) && self.0 & (1 << (thread - 1)) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Thread numbers in ascending order
    pub fn threads(self) -> impl Iterator<Item = u8> {
        (1..=PC_THREADS).filter(move |&thread| self.contains(thread))
    }
}

/// Packs thread numbers into a mask
pub fn pack_threads(threads: &[u8]) -> Result<ThreadMask> {
    ThreadMask::from_threads(threads)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_threads() {
        let mask = pack_threads(&[2, 4]).unwrap();
        assert_eq!(mask.bits(), 0b0_1010);
        assert_eq!(mask.threads().collect::<Vec<_>>(), vec![2, 4]);
        assert_eq!(mask.count(), 2);

        assert_eq!(pack_threads(&[4, 2, 4]).unwrap(), mask);
        assert!(matches!(pack_threads(&[0]), Err(KHIError::InvalidThread(0))));
        assert!(matches!(pack_threads(&[6]), Err(KHIError::InvalidThread(6))));
    }

    #[test]
    fn test_mask_ignores_bits_above_thread_five() {
        let mask = ThreadMask::from_bits(0xFF);
        assert_eq!(mask, ThreadMask::ALL);
        assert_eq!(mask.threads().collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
        assert!(!ThreadMask::empty().contains(1));
        assert!(ThreadMask::empty().is_empty());
    }

    #[test]
    fn test_frame_batch() {
        let frame = frame_batch(b".PROGRAM a\n");
        assert_eq!(&frame[..BATCH_PREFIX.len()], BATCH_PREFIX);
        assert_eq!(frame.last(), Some(&0x17));
        assert_eq!(
            frame_batch(END_OF_LOAD),
            b"\x02\x43    \x30\x1a\x17\x02\x45    \x30\x17".to_vec()
        );
    }

    #[test]
    fn test_command_text() {
        assert_eq!(pc_execute(3, "posmon.pc"), "PCEXE 3: posmon.pc");
        assert_eq!(pc_kill(1), "PCKILL 1:");
        assert_eq!(pc_status(5), "PCSTATUS 5:");
        assert_eq!(delete_program("kep"), "DELETE/P/D kep");
        assert_eq!(set_switch("CS", false), "SWITCH CS OFF");
    }

    #[test]
    fn test_contains() {
        assert!(contains(b"xx\r\nProgram does not exist.\r\n>", PROG_NOT_EXIST));
        assert!(!contains(b"\r\n>", PROG_NOT_EXIST));
        assert!(!contains(b"abc", b""));
    }
}
