// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use slog::{o, Drain};

use nvme_emu::bits::*;
use nvme_emu::common::{HostAddr, PAGE_SIZE};
use nvme_emu::usdt::register_probes;
use nvme_emu::Controller;

mod config;

/// Depth of both admin queues, as small as the protocol allows.
const ADMIN_DEPTH: u16 = 2;

#[derive(Serialize)]
struct CommandReport {
    opcode: u8,
    cid: u16,
    sct: u8,
    sc: u8,
    dw0: u32,
}

impl CommandReport {
    fn new(opcode: u8, cqe: &CompletionQueueEntry) -> Self {
        Self {
            opcode,
            cid: cqe.cid,
            sct: cqe.sct(),
            sc: cqe.sc(),
            dw0: cqe.dw0,
        }
    }
}

#[derive(Serialize)]
struct Report {
    serial: String,
    model: String,
    firmware_revision: String,
    ready: bool,
    admin_cq_head: Option<u16>,
    commands: Vec<CommandReport>,
}

/// Host side of the admin queue pair.
struct AdminQueues {
    asq: HostAddr,
    acq: HostAddr,
    tail: u16,
    head: u16,
    phase: bool,
}

impl AdminQueues {
    /// Place `sqe` in the ASQ, ring the doorbell and wait for its
    /// completion.
    fn submit(
        &mut self,
        ctrl: &Controller,
        sqe: &SubmissionQueueEntry,
    ) -> anyhow::Result<CompletionQueueEntry> {
        let mem = ctrl.memory();
        let slot = self.asq.offset::<SubmissionQueueEntry>(self.tail as usize);
        anyhow::ensure!(mem.write(slot, sqe), "failed to write command");
        self.tail = (self.tail + 1) % ADMIN_DEPTH;
        ctrl.registers().ring_sq_tail(0, self.tail)?;
        ctrl.wait_for_change_loop();

        let slot = self.acq.offset::<CompletionQueueEntry>(self.head as usize);
        let cqe: CompletionQueueEntry =
            mem.read(slot).context("failed to read completion")?;
        anyhow::ensure!(
            cqe.phase() == self.phase,
            "no completion posted for cid {}",
            sqe.cid()
        );
        self.head = (self.head + 1) % ADMIN_DEPTH;
        if self.head == 0 {
            self.phase = !self.phase;
        }
        Ok(cqe)
    }
}

/// Bring the controller up, then issue Keep Alive and Identify Controller
/// through a minimal admin queue pair.
fn exercise(ctrl: &Controller, log: &slog::Logger) -> anyhow::Result<Report> {
    let mem = ctrl.memory();
    let regs = ctrl.registers();
    let asq = mem.alloc(PAGE_SIZE).context("no memory for the ASQ")?;
    let acq = mem.alloc(PAGE_SIZE).context("no memory for the ACQ")?;

    regs.set_aqa(
        AdminQueueAttrs(0)
            .with_asqs(ADMIN_DEPTH - 1)
            .with_acqs(ADMIN_DEPTH - 1),
    );
    regs.set_asq(asq.0);
    regs.set_acq(acq.0);
    regs.set_cc(
        Configuration(0)
            .with_iosqes(SQES_LOG2)
            .with_iocqes(CQES_LOG2)
            .with_enabled(true),
    );
    ctrl.wait_for_change_loop();
    anyhow::ensure!(regs.csts().ready(), "controller did not become ready");
    slog::info!(log, "controller ready");

    let mut queues = AdminQueues { asq, acq, tail: 0, head: 0, phase: true };
    let mut commands = Vec::new();

    let keep_alive = SubmissionQueueEntry::new(ADMIN_OPC_KEEP_ALIVE, 0);
    let cqe = queues.submit(ctrl, &keep_alive)?;
    slog::info!(log, "keep alive completed";
        "cid" => cqe.cid,
        "status" => cqe.status(),
        "cq_head" => regs.cq_head(0)
    );
    commands.push(CommandReport::new(ADMIN_OPC_KEEP_ALIVE, &cqe));

    let buf = mem.alloc(PAGE_SIZE).context("no memory for identify")?;
    let mut identify = SubmissionQueueEntry::new(ADMIN_OPC_IDENTIFY, 1);
    identify.prp1 = buf.0;
    identify.cdw10 = IDENT_CNS_CONTROLLER as u32;
    let cqe = queues.submit(ctrl, &identify)?;
    slog::info!(log, "identify controller completed";
        "cid" => cqe.cid,
        "status" => cqe.status()
    );
    commands.push(CommandReport::new(ADMIN_OPC_IDENTIFY, &cqe));

    let ident: IdentifyController =
        mem.read(buf).context("failed to read identify data")?;
    let text = |raw: &[u8]| String::from_utf8_lossy(raw).trim_end().to_string();

    Ok(Report {
        serial: text(&ident.sn[..]),
        model: text(&ident.mn[..]),
        firmware_revision: text(&ident.fr[..]),
        ready: regs.csts().ready(),
        admin_cq_head: regs.cq_head(0),
        commands,
    })
}

#[derive(clap::Parser)]
/// Run an emulated NVMe controller through a basic admin exchange.
struct Args {
    /// Controller config file
    #[clap(value_name = "CONFIG", action)]
    config: String,

    /// Command-response file, overriding any named in the config
    #[clap(long, value_name = "FILE", action)]
    hook: Option<PathBuf>,

    /// Print a JSON report of the exchange on stdout
    #[clap(long, action)]
    json: bool,
}

fn build_log() -> (slog::Logger, slog_async::AsyncGuard) {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
    (slog::Logger::root(drain.fuse(), o!()), guard)
}

fn main() -> anyhow::Result<()> {
    let Args { config: config_path, hook, json } = Args::parse();

    // Ensure proper setup of USDT probes
    register_probes().context("Failed to setup USDT probes")?;

    let (log, _log_async_guard) = build_log();

    let config = config::parse(&config_path)?;
    let mut ctrl_config = config.ctrl_config();
    if hook.is_some() {
        ctrl_config.command_response_file = hook;
    }

    let ctrl = Controller::new(ctrl_config, log.clone())
        .context("Failed to create controller")?;
    let report = exercise(&ctrl, &log)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}
