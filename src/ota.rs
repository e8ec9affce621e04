use std::io::Read;

use anyhow::{anyhow, bail, Context, Result};
use log::{info, warn};

/// Anything smaller than this cannot be a plausible app image.
pub const MIN_IMAGE_BYTES: u64 = 32 * 1024;

/// Flash write granularity for the streaming copy.
pub const CHUNK_BYTES: usize = 8 * 1024;

const PROGRESS_STEP_PCT: u64 = 5;

/// Raw firmware image dropped on the SD card by the user.
pub const UPDATE_IMAGE_PATH: &str = "/sdcard/firmware.bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    Validating,
    Writing,
    Finalizing,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionInfo {
    pub address: u32,
    pub size: u32,
}

/// Flash side of the update. The hardware implementation wraps the
/// `esp_ota_*` API; tests substitute an in-memory double.
pub trait UpdateTarget {
    fn running_partition(&self) -> PartitionInfo;
    fn next_update_partition(&self) -> Option<PartitionInfo>;
    fn begin(&mut self, target: PartitionInfo, image_len: u64) -> Result<()>;
    fn write(&mut self, chunk: &[u8]) -> Result<()>;
    fn end(&mut self) -> Result<()>;
    fn abort(&mut self);
    fn set_boot_partition(&mut self, target: PartitionInfo) -> Result<()>;
}

pub struct UpdatePipeline<T: UpdateTarget> {
    target: T,
    state: UpdateState,
}

impl<T: UpdateTarget> UpdatePipeline<T> {
    pub fn new(target: T) -> Self {
        Self {
            target,
            state: UpdateState::Idle,
        }
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    /// Validate the image, stream it into the inactive partition, and switch
    /// the boot pointer. On any failure the boot pointer is left unchanged,
    /// so the device keeps booting the old image.
    pub fn run(&mut self, source: &mut dyn Read, image_len: u64) -> Result<PartitionInfo> {
        self.state = UpdateState::Validating;
        let target = match self.validate(image_len) {
            Ok(t) => t,
            Err(e) => {
                self.state = UpdateState::Failed;
                return Err(e);
            }
        };
        info!(
            "update: writing {} bytes to partition @{:#x} ({} bytes)",
            image_len, target.address, target.size
        );

        self.state = UpdateState::Writing;
        if let Err(e) = self.write_image(target, source, image_len) {
            self.target.abort();
            self.state = UpdateState::Failed;
            return Err(e);
        }

        self.state = UpdateState::Finalizing;
        if let Err(e) = self.target.end() {
            // Flash already written, boot target unchanged: safe outcome.
            self.state = UpdateState::Failed;
            return Err(e).context("finalizing update session");
        }

        if let Err(e) = self.target.set_boot_partition(target) {
            self.state = UpdateState::Failed;
            return Err(e).context("switching boot partition");
        }
        self.state = UpdateState::Done;
        info!("update: boot partition set to @{:#x}", target.address);
        Ok(target)
    }

    fn validate(&self, image_len: u64) -> Result<PartitionInfo> {
        if image_len < MIN_IMAGE_BYTES {
            bail!(
                "image is {} bytes, below the {} byte minimum",
                image_len,
                MIN_IMAGE_BYTES
            );
        }
        let running = self.target.running_partition();
        let target = self
            .target
            .next_update_partition()
            .ok_or_else(|| anyhow!("no inactive update partition available"))?;
        if image_len > target.size as u64 {
            bail!(
                "image is {} bytes, target partition holds {}",
                image_len,
                target.size
            );
        }
        // Should be unreachable with a sane partition table.
        if target.address == running.address {
            bail!(
                "target partition @{:#x} is the running partition",
                target.address
            );
        }
        Ok(target)
    }

    fn write_image(
        &mut self,
        target: PartitionInfo,
        source: &mut dyn Read,
        image_len: u64,
    ) -> Result<()> {
        self.target.begin(target, image_len)?;
        let mut buf = vec![0u8; CHUNK_BYTES];
        let mut written: u64 = 0;
        let mut next_pct = PROGRESS_STEP_PCT;
        while written < image_len {
            let want = CHUNK_BYTES.min((image_len - written) as usize);
            let n = source.read(&mut buf[..want]).context("reading image")?;
            if n == 0 {
                bail!("image ended early at {} of {} bytes", written, image_len);
            }
            self.target.write(&buf[..n]).context("writing flash")?;
            written += n as u64;
            let pct = written * 100 / image_len;
            while pct >= next_pct && next_pct <= 100 {
                info!("update: {}% ({} / {} bytes)", next_pct, written, image_len);
                next_pct += PROGRESS_STEP_PCT;
            }
        }
        Ok(())
    }
}

fn esp_check(res: esp_idf_sys::esp_err_t, msg: &str) -> Result<()> {
    if res != esp_idf_sys::ESP_OK {
        Err(anyhow!("{} (err {})", msg, res))
    } else {
        Ok(())
    }
}

fn part_info(p: *const esp_idf_sys::esp_partition_t) -> PartitionInfo {
    unsafe {
        PartitionInfo {
            address: (*p).address,
            size: (*p).size,
        }
    }
}

/// [`UpdateTarget`] over the raw `esp_ota_*` API.
pub struct EspUpdateTarget {
    running: *const esp_idf_sys::esp_partition_t,
    next: *const esp_idf_sys::esp_partition_t,
    handle: esp_idf_sys::esp_ota_handle_t,
    in_session: bool,
}

impl EspUpdateTarget {
    pub fn new() -> Result<Self> {
        let running = unsafe { esp_idf_sys::esp_ota_get_running_partition() };
        if running.is_null() {
            bail!("running partition unknown");
        }
        let next = unsafe { esp_idf_sys::esp_ota_get_next_update_partition(std::ptr::null()) };
        Ok(Self {
            running,
            next,
            handle: 0,
            in_session: false,
        })
    }
}

impl UpdateTarget for EspUpdateTarget {
    fn running_partition(&self) -> PartitionInfo {
        part_info(self.running)
    }

    fn next_update_partition(&self) -> Option<PartitionInfo> {
        if self.next.is_null() {
            None
        } else {
            Some(part_info(self.next))
        }
    }

    fn begin(&mut self, target: PartitionInfo, image_len: u64) -> Result<()> {
        if self.next.is_null() || part_info(self.next) != target {
            bail!("begin: partition @{:#x} is not the update slot", target.address);
        }
        esp_check(
            unsafe { esp_idf_sys::esp_ota_begin(self.next, image_len as usize, &mut self.handle) },
            "esp_ota_begin",
        )?;
        self.in_session = true;
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<()> {
        esp_check(
            unsafe {
                esp_idf_sys::esp_ota_write(self.handle, chunk.as_ptr().cast(), chunk.len())
            },
            "esp_ota_write",
        )
    }

    fn end(&mut self) -> Result<()> {
        self.in_session = false;
        esp_check(unsafe { esp_idf_sys::esp_ota_end(self.handle) }, "esp_ota_end")
    }

    fn abort(&mut self) {
        if self.in_session {
            self.in_session = false;
            unsafe { esp_idf_sys::esp_ota_abort(self.handle) };
        }
    }

    fn set_boot_partition(&mut self, target: PartitionInfo) -> Result<()> {
        if self.next.is_null() || part_info(self.next) != target {
            bail!("boot switch: partition @{:#x} is not the update slot", target.address);
        }
        esp_check(
            unsafe { esp_idf_sys::esp_ota_set_boot_partition(self.next) },
            "esp_ota_set_boot_partition",
        )
    }
}

/// Look for an update image on the SD card and apply it. Returns `Ok(false)`
/// when no image is present; `Ok(true)` means the boot partition was
/// switched and the caller should reboot. The image is renamed with a
/// `.used` suffix after the attempt, success or failure, so it never
/// triggers twice.
pub fn update_from_sd() -> Result<bool> {
    let meta = match std::fs::metadata(UPDATE_IMAGE_PATH) {
        Ok(m) => m,
        Err(_) => return Ok(false),
    };
    info!(
        "update: found {} ({} bytes)",
        UPDATE_IMAGE_PATH,
        meta.len()
    );

    let result = (|| -> Result<()> {
        let mut file = std::fs::File::open(UPDATE_IMAGE_PATH)?;
        let target = EspUpdateTarget::new()?;
        let mut pipeline = UpdatePipeline::new(target);
        pipeline.run(&mut file, meta.len())?;
        Ok(())
    })();

    let used = format!("{}.used", UPDATE_IMAGE_PATH);
    if let Err(e) = std::fs::rename(UPDATE_IMAGE_PATH, &used) {
        warn!("update: could not rename image to {}: {}", used, e);
    }

    result.map(|_| true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct MockTarget {
        running: PartitionInfo,
        next: Option<PartitionInfo>,
        begun: Option<(PartitionInfo, u64)>,
        written: Vec<u8>,
        ended: bool,
        aborted: bool,
        boot: Option<PartitionInfo>,
        fail_write_after: Option<usize>,
    }

    impl MockTarget {
        fn new(running: PartitionInfo, next: Option<PartitionInfo>) -> Self {
            Self {
                running,
                next,
                begun: None,
                written: Vec::new(),
                ended: false,
                aborted: false,
                boot: None,
                fail_write_after: None,
            }
        }
    }

    impl UpdateTarget for MockTarget {
        fn running_partition(&self) -> PartitionInfo {
            self.running
        }

        fn next_update_partition(&self) -> Option<PartitionInfo> {
            self.next
        }

        fn begin(&mut self, target: PartitionInfo, image_len: u64) -> Result<()> {
            self.begun = Some((target, image_len));
            Ok(())
        }

        fn write(&mut self, chunk: &[u8]) -> Result<()> {
            if let Some(limit) = self.fail_write_after {
                if self.written.len() + chunk.len() > limit {
                    bail!("simulated flash write failure");
                }
            }
            self.written.extend_from_slice(chunk);
            Ok(())
        }

        fn end(&mut self) -> Result<()> {
            self.ended = true;
            Ok(())
        }

        fn abort(&mut self) {
            self.aborted = true;
        }

        fn set_boot_partition(&mut self, target: PartitionInfo) -> Result<()> {
            self.boot = Some(target);
            Ok(())
        }
    }

    const RUNNING: PartitionInfo = PartitionInfo {
        address: 0x10000,
        size: 0x180000,
    };
    const TARGET: PartitionInfo = PartitionInfo {
        address: 0x190000,
        size: 0x180000,
    };

    /// Read source that runs dry before the declared image length.
    struct ShortSource {
        remaining: usize,
    }

    impl Read for ShortSource {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.remaining.min(buf.len());
            self.remaining -= n;
            for b in &mut buf[..n] {
                *b = 0xA5;
            }
            Ok(n)
        }
    }

    #[test]
    fn rejects_undersized_image_before_any_write() {
        let mut p = UpdatePipeline::new(MockTarget::new(RUNNING, Some(TARGET)));
        let err = p.run(&mut Cursor::new(vec![0u8; 1000]), 1000).unwrap_err();
        assert!(err.to_string().contains("minimum"));
        assert_eq!(p.state(), UpdateState::Failed);
        assert!(p.target.begun.is_none());
        assert!(p.target.written.is_empty());
        assert!(p.target.boot.is_none());
    }

    #[test]
    fn rejects_image_larger_than_target_before_any_write() {
        let len = TARGET.size as u64 + 1;
        let mut p = UpdatePipeline::new(MockTarget::new(RUNNING, Some(TARGET)));
        let mut src = ShortSource {
            remaining: len as usize,
        };
        let err = p.run(&mut src, len).unwrap_err();
        assert!(err.to_string().contains("target partition holds"));
        assert!(p.target.begun.is_none());
        assert!(p.target.boot.is_none());
    }

    #[test]
    fn rejects_missing_update_partition() {
        let mut p = UpdatePipeline::new(MockTarget::new(RUNNING, None));
        let err = p
            .run(&mut Cursor::new(vec![0u8; 65536]), 65536)
            .unwrap_err();
        assert!(err.to_string().contains("no inactive update partition"));
        assert!(p.target.begun.is_none());
    }

    #[test]
    fn rejects_target_equal_to_running_partition() {
        let mut p = UpdatePipeline::new(MockTarget::new(RUNNING, Some(RUNNING)));
        let err = p
            .run(&mut Cursor::new(vec![0u8; 65536]), 65536)
            .unwrap_err();
        assert!(err.to_string().contains("running partition"));
        assert!(p.target.begun.is_none());
        assert!(p.target.boot.is_none());
    }

    #[test]
    fn clean_run_switches_boot_to_target() {
        let image: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let len = image.len() as u64;
        let mut p = UpdatePipeline::new(MockTarget::new(RUNNING, Some(TARGET)));
        let done = p.run(&mut Cursor::new(image.clone()), len).unwrap();
        assert_eq!(done, TARGET);
        assert_eq!(p.state(), UpdateState::Done);
        assert_eq!(p.target.begun, Some((TARGET, len)));
        assert_eq!(p.target.written, image);
        assert!(p.target.ended);
        assert!(!p.target.aborted);
        assert_eq!(p.target.boot, Some(TARGET));
    }

    #[test]
    fn short_source_aborts_without_boot_switch() {
        let mut p = UpdatePipeline::new(MockTarget::new(RUNNING, Some(TARGET)));
        let mut src = ShortSource { remaining: 40_000 };
        let err = p.run(&mut src, 64 * 1024).unwrap_err();
        assert!(err.to_string().contains("ended early"));
        assert_eq!(p.state(), UpdateState::Failed);
        assert!(p.target.aborted);
        assert!(!p.target.ended);
        assert!(p.target.boot.is_none());
    }

    #[test]
    fn write_error_aborts_without_boot_switch() {
        let mut target = MockTarget::new(RUNNING, Some(TARGET));
        target.fail_write_after = Some(16 * 1024);
        let mut p = UpdatePipeline::new(target);
        let err = p
            .run(&mut Cursor::new(vec![0u8; 64 * 1024]), 64 * 1024)
            .unwrap_err();
        assert!(err.to_string().contains("writing flash"));
        assert!(p.target.aborted);
        assert!(p.target.boot.is_none());
    }
}
