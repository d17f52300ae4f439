/*
    Lorraine
    https://github.com/lorraine-emu/lorraine

    Copyright 2022-2025 The Lorraine contributors

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    messages.rs

    The message queue through which the core informs the host about state
    changes. The host end keeps the receiver; the machine clones the sender
    into whatever component needs to report.

*/

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Msg {
    PowerOn,
    PowerOff,
    Reset,
    Run,
    Pause,
    WarpOn,
    WarpOff,
    RomMissing,
    MemLayout,
    BreakpointReached,
    SnapshotTaken,
    Config,
}

/// Sending half of the host message queue. Cheap to clone.
#[derive(Clone)]
pub struct MsgSender {
    tx: Sender<Msg>,
}

impl MsgSender {
    pub fn send(&self, msg: Msg) {
        // The channel is unbounded; a send can only fail if the host dropped
        // the receiver, in which case messages are simply discarded.
        if self.tx.send(msg).is_err() {
            log::trace!("Message {:?} dropped: no receiver", msg);
        }
    }
}

pub struct MsgQueue {
    tx: MsgSender,
    rx: Receiver<Msg>,
}

impl Default for MsgQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MsgQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx: MsgSender { tx },
            rx,
        }
    }

    pub fn sender(&self) -> MsgSender {
        self.tx.clone()
    }

    /// Non-blocking poll used by the host UI loop.
    pub fn try_recv(&self) -> Option<Msg> {
        match self.rx.try_recv() {
            Ok(msg) => Some(msg),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Drain every pending message.
    pub fn drain(&self) -> Vec<Msg> {
        let mut msgs = Vec::new();
        while let Some(msg) = self.try_recv() {
            msgs.push(msg);
        }
        msgs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_delivers_in_order() {
        let queue = MsgQueue::new();
        let tx = queue.sender();

        tx.send(Msg::PowerOn);
        tx.send(Msg::MemLayout);
        tx.send(Msg::Run);

        assert_eq!(queue.try_recv(), Some(Msg::PowerOn));
        assert_eq!(queue.try_recv(), Some(Msg::MemLayout));
        assert_eq!(queue.try_recv(), Some(Msg::Run));
        assert_eq!(queue.try_recv(), None);
    }

    #[test]
    fn send_without_receiver_does_not_panic() {
        let tx = {
            let queue = MsgQueue::new();
            queue.sender()
        };
        tx.send(Msg::Pause);
    }
}
