use std::io;

use log::{debug, info};
use nfq::{Message, Queue, Verdict};

use crate::device::CaptureDevice;

/// Netfilter queue as a capture device.
///
/// Each read holds the queued message until it is written back, which
/// accepts it with the written bytes as the new payload. A message that is
/// never written is dropped when the next one is read. NFQUEUE gives one
/// verdict per queued packet, so a second write for the same read fails.
pub struct NfqueueDevice {
    queue: Queue,
    queue_num: u16,
    held: Option<Message>,
}

impl NfqueueDevice {
    pub fn open(queue_num: u16) -> io::Result<Self> {
        let mut queue = Queue::open()?;
        queue.bind(queue_num)?;
        info!("Bound NFQUEUE {}", queue_num);
        Ok(Self {
            queue,
            queue_num,
            held: None,
        })
    }

    fn drop_held(&mut self) -> io::Result<()> {
        if let Some(mut msg) = self.held.take() {
            debug!("NFQUEUE {}: dropping unwritten packet", self.queue_num);
            msg.set_verdict(Verdict::Drop);
            self.queue.verdict(msg)?;
        }
        Ok(())
    }
}

impl CaptureDevice for NfqueueDevice {
    fn read_packet(&mut self) -> io::Result<Vec<u8>> {
        self.drop_held()?;
        let msg = self.queue.recv()?;
        let payload = msg.get_payload().to_vec();
        self.held = Some(msg);
        Ok(payload)
    }

    fn write_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        let mut msg = self.held.take().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Other,
                "NFQUEUE allows a single verdict per queued packet",
            )
        })?;
        msg.set_payload(packet.to_vec());
        msg.set_verdict(Verdict::Accept);
        self.queue.verdict(msg)
    }
}

impl Drop for NfqueueDevice {
    fn drop(&mut self) {
        let _ = self.drop_held();
    }
}
