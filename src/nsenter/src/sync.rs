use std::{
    fmt,
    fs::File,
    io::{ErrorKind, Read, Write},
    os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
};

/// Messages exchanged between a bootstrap child and its privileged parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SyncMsg {
    UsermapPls = 0x40,
    UsermapAck = 0x41,
    RecvPidPls = 0x42,
    RecvPidAck = 0x43,
    TimeOffsetsPls = 0x44,
    TimeOffsetsAck = 0x45,
}

impl SyncMsg {
    /// The acknowledgement a request must be answered with.
    pub fn ack(self) -> Option<SyncMsg> {
        match self {
            SyncMsg::UsermapPls => Some(SyncMsg::UsermapAck),
            SyncMsg::RecvPidPls => Some(SyncMsg::RecvPidAck),
            SyncMsg::TimeOffsetsPls => Some(SyncMsg::TimeOffsetsAck),
            _ => None,
        }
    }
}

impl TryFrom<u32> for SyncMsg {
    type Error = SyncError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0x40 => SyncMsg::UsermapPls,
            0x41 => SyncMsg::UsermapAck,
            0x42 => SyncMsg::RecvPidPls,
            0x43 => SyncMsg::RecvPidAck,
            0x44 => SyncMsg::TimeOffsetsPls,
            0x45 => SyncMsg::TimeOffsetsAck,
            _ => return Err(SyncError::Unknown(value)),
        })
    }
}

impl fmt::Display for SyncMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncMsg::UsermapPls => "SYNC_USERMAP_PLS",
            SyncMsg::UsermapAck => "SYNC_USERMAP_ACK",
            SyncMsg::RecvPidPls => "SYNC_RECVPID_PLS",
            SyncMsg::RecvPidAck => "SYNC_RECVPID_ACK",
            SyncMsg::TimeOffsetsPls => "SYNC_TIMEOFFSETS_PLS",
            SyncMsg::TimeOffsetsAck => "SYNC_TIMEOFFSETS_ACK",
        };
        write!(f, "{}({:#x})", name, *self as u32)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("failed to sync with parent: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to sync with parent: short {what} ({got} bytes)")]
    Short { what: &'static str, got: usize },
    #[error("failed to sync with parent: unknown message {0:#x}")]
    Unknown(u32),
    #[error("failed to sync with parent: expected {want}, got {got}")]
    Unexpected { want: SyncMsg, got: SyncMsg },
}

/// One end of the synchronization socket. Every read and write moves exactly
/// one 32-bit word; anything else is a protocol violation.
pub struct SyncChannel {
    file: File,
}

impl SyncChannel {
    pub fn new(fd: OwnedFd) -> Self {
        SyncChannel { file: File::from(fd) }
    }

    /// # Safety
    /// `fd` must be an open descriptor owned by nothing else.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        SyncChannel {
            file: File::from_raw_fd(fd),
        }
    }

    fn write_word(&mut self, word: [u8; 4], what: &'static str) -> Result<(), SyncError> {
        let n = loop {
            match self.file.write(&word) {
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                res => break res?,
            }
        };
        if n != word.len() {
            return Err(SyncError::Short { what, got: n });
        }
        Ok(())
    }

    fn read_word(&mut self, what: &'static str) -> Result<[u8; 4], SyncError> {
        let mut word = [0u8; 4];
        let mut got = 0;
        while got < word.len() {
            match self.file.read(&mut word[got..]) {
                Ok(0) => return Err(SyncError::Short { what, got }),
                Ok(n) => got += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(word)
    }

    pub fn send(&mut self, msg: SyncMsg) -> Result<(), SyncError> {
        self.write_word((msg as u32).to_ne_bytes(), "write")
    }

    pub fn recv(&mut self) -> Result<SyncMsg, SyncError> {
        SyncMsg::try_from(u32::from_ne_bytes(self.read_word("read")?))
    }

    /// Reads the next message and fails unless it is `want`.
    pub fn expect(&mut self, want: SyncMsg) -> Result<(), SyncError> {
        match self.recv()? {
            got if got == want => Ok(()),
            got => Err(SyncError::Unexpected { want, got }),
        }
    }

    /// Sends `req` and blocks for its acknowledgement.
    pub fn request(&mut self, req: SyncMsg) -> Result<(), SyncError> {
        self.send(req)?;
        match req.ack() {
            Some(ack) => self.expect(ack),
            None => Ok(()),
        }
    }

    pub fn send_pid(&mut self, pid: i32) -> Result<(), SyncError> {
        self.write_word(pid.to_ne_bytes(), "pid write")
    }

    pub fn recv_pid(&mut self) -> Result<i32, SyncError> {
        Ok(i32::from_ne_bytes(self.read_word("pid read")?))
    }
}

impl AsFd for SyncChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}
