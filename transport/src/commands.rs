use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Command ids understood by the monitor firmware. The id is the first word of every frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum CommandId {
    // data out (device to host)
    StartSending = 100,
    StartMissingSeq = 1000,
    MissingSeq = 1001,
    SequencedData = 1002,
    EndOfStream = 1003,
    Clear = 1010,

    // data in (host to device)
    SendDataToLocation = 200,
    SendSeqData = 2000,
    SendTell = 2001,
    ReceiveMissingSeqData = 2002,
    ReceiveFinished = 2003,

    // continuous delivery
    HostSendSequenced = 300,
    RequestBuffers = 301,
    EventStop = 302,
}

impl CommandId {
    /// Commands whose third word is a sequence number
    pub fn is_sequenced(&self) -> bool {
        matches!(self, CommandId::SequencedData | CommandId::SendSeqData)
    }

    /// Commands that end a (re)transmission round by themselves, without payload
    pub fn is_end_flag(&self) -> bool {
        matches!(self, CommandId::EndOfStream | CommandId::SendTell)
    }

    /// The command that carries data chunks in the given direction
    pub fn data_command(direction: TransferDirection) -> CommandId {
        match direction {
            TransferDirection::Extract => CommandId::SequencedData,
            TransferDirection::Inject => CommandId::SendSeqData,
        }
    }

    pub fn end_command(direction: TransferDirection) -> CommandId {
        match direction {
            TransferDirection::Extract => CommandId::EndOfStream,
            TransferDirection::Inject => CommandId::SendTell,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TransferDirection {
    /// device to host
    Extract,
    /// host to device
    Inject,
}
