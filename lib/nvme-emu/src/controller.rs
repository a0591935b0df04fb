// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::bits::*;
use crate::config::CtrlConfig;
use crate::ctrl::NvmeCtrl;
use crate::hook::CommandResponseHook;
use crate::mem::HostMem;
use crate::queue::MAX_QUEUE_SIZE;
use crate::regs::RegisterBlock;
use crate::NvmeError;

use slog::Logger;

/// Progress of the doorbell worker.
#[derive(Debug, Default)]
struct LoopState {
    /// Passes begun.
    started: u64,
    /// Passes finished.
    completed: u64,
    /// Host activity not yet covered by a pass.
    dirty: bool,
    exit: bool,
}

#[derive(Default)]
struct Watch {
    state: Mutex<LoopState>,
    cv: Condvar,
}

impl Watch {
    /// Note host activity and wake the worker.
    fn poke(&self) {
        self.state.lock().unwrap().dirty = true;
        self.cv.notify_all();
    }

    fn stop(&self) {
        self.state.lock().unwrap().exit = true;
        self.cv.notify_all();
    }
}

/// Marks the loop as exited when the worker leaves, panicking or not.
struct ExitGuard(Arc<Watch>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let mut state = match self.0.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.exit = true;
        self.0.cv.notify_all();
    }
}

/// An emulated NVMe controller.
///
/// The host side interacts with it through the [`RegisterBlock`] and the
/// [`HostMem`] it shares with the controller. A worker thread runs the
/// doorbell watch loop for as long as the `Controller` lives.
pub struct Controller {
    regs: Arc<RegisterBlock>,
    mem: Arc<HostMem>,
    ctrl: Arc<Mutex<NvmeCtrl>>,
    watch: Arc<Watch>,
    worker: Option<JoinHandle<()>>,
    log: Logger,
}

impl Controller {
    /// Build a controller from `cfg` and start its doorbell worker.
    pub fn new(cfg: CtrlConfig, log: Logger) -> Result<Self, NvmeError> {
        cfg.validate()?;

        let cap = Capabilities(0)
            // Queues must be physically contiguous
            .with_cqr(true)
            // Max queue entries, 0's based
            .with_mqes((MAX_QUEUE_SIZE - 1) as u16)
            // Timeout in 500ms units; enabling is effectively immediate
            .with_to(1)
            // Doorbell stride of 4 bytes
            .with_dstrd(0)
            .with_css_nvm(true)
            // 4K pages only
            .with_mpsmin(0)
            .with_mpsmax(0);

        let regs = Arc::new(RegisterBlock::new(
            cap,
            cfg.max_io_queues,
            log.new(slog::o!("unit" => "regs")),
        ));
        let mem = Arc::new(HostMem::new(cfg.mem_size));
        let ctrl = Arc::new(Mutex::new(NvmeCtrl::new(
            &cfg,
            regs.clone(),
            mem.clone(),
            log.new(slog::o!("unit" => "ctrl")),
        )));
        let watch = Arc::new(Watch::default());

        let worker = {
            let ctrl = ctrl.clone();
            let watch = watch.clone();
            let log = log.new(slog::o!("unit" => "worker"));
            std::thread::Builder::new()
                .name("nvme-emu doorbell".to_string())
                .spawn(move || watch_loop(ctrl, watch, log))
                .map_err(NvmeError::Spawn)?
        };

        let notify_watch = watch.clone();
        regs.set_notify(Some(Box::new(move || notify_watch.poke())));

        slog::info!(log, "controller attached";
            "serial" => &cfg.serial,
            "namespaces" => cfg.namespaces.len(),
            "max_io_queues" => cfg.max_io_queues
        );

        Ok(Self { regs, mem, ctrl, watch, worker: Some(worker), log })
    }

    /// The controller's register file.
    pub fn registers(&self) -> &Arc<RegisterBlock> {
        &self.regs
    }

    /// Memory shared with the host.
    pub fn memory(&self) -> &Arc<HostMem> {
        &self.mem
    }

    /// Block until a full pass of the watch loop which started after this
    /// call has finished.
    ///
    /// Returns immediately if the worker is no longer running.
    pub fn wait_for_change_loop(&self) {
        let mut state = self.watch.state.lock().unwrap();
        let target = state.started + 1;
        state.dirty = true;
        self.watch.cv.notify_all();
        let _state = self
            .watch
            .cv
            .wait_while(state, |s| s.completed < target && !s.exit)
            .unwrap();
    }

    /// Read controller register space at `offset`.
    pub fn reg_read(
        &self,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<(), NvmeError> {
        self.regs.reg_read(offset, buf)
    }

    /// Write controller register space at `offset`.
    pub fn reg_write(
        &self,
        offset: usize,
        buf: &[u8],
    ) -> Result<(), NvmeError> {
        self.regs.reg_write(offset, buf)
    }

    /// Point the command-response hook at `path`, or remove it.
    pub fn set_command_response_file_path(&self, path: Option<PathBuf>) {
        let hook = path.map(|path| {
            slog::info!(self.log, "command-response file set";
                "path" => %path.display()
            );
            CommandResponseHook::new(
                path,
                self.log.new(slog::o!("unit" => "hook")),
            )
        });
        self.ctrl.lock().unwrap().set_command_response_hook(hook);
    }

    /// The Identify Controller structure as currently reported.
    pub fn identify_controller(&self) -> IdentifyController {
        self.ctrl.lock().unwrap().ctrl_ident
    }

    /// The Firmware Slot Information log page as currently reported.
    pub fn firmware_slot_info(&self) -> FirmwareSlotInfo {
        *self.ctrl.lock().unwrap().firmware.slot_info()
    }

    /// Number of image chunks downloaded but not yet committed.
    pub fn firmware_staging_len(&self) -> usize {
        self.ctrl.lock().unwrap().firmware.staging_len()
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.regs.set_notify(None);
        self.watch.stop();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                slog::error!(self.log, "doorbell worker panicked");
            }
        }
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("regs", &self.regs)
            .finish_non_exhaustive()
    }
}

/// Body of the doorbell worker: one service pass per wakeup.
fn watch_loop(ctrl: Arc<Mutex<NvmeCtrl>>, watch: Arc<Watch>, log: Logger) {
    let _guard = ExitGuard(watch.clone());
    slog::debug!(log, "doorbell worker started");
    loop {
        let pass = {
            let state = watch.state.lock().unwrap();
            let mut state = watch
                .cv
                .wait_while(state, |s| !s.dirty && !s.exit)
                .unwrap();
            if state.exit {
                break;
            }
            state.dirty = false;
            state.started += 1;
            state.started
        };

        ctrl.lock().unwrap().service();

        watch.state.lock().unwrap().completed = pass;
        watch.cv.notify_all();
    }
    slog::debug!(log, "doorbell worker exiting");
}
