use clap::Parser;

use undologd::checkpoint::Coordinator;
use undologd::config::Config;
use undologd::log::LogManager;
use undologd::wal::{MemoryWal, MemoryWalCursor};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = Config::parse();
    let manager = LogManager::new(&config.data_dir, config.max_logs)
        .with_max_log_size(config.max_log_size());
    let coordinator = Coordinator::new(config.checkpoint_dir());

    let wal = MemoryWal::new();
    let mut cursor = MemoryWalCursor::new(&wal);
    let redo_lsn = coordinator.startup(&manager, &mut cursor)?;

    log::info!(
        "recovered undo engine state at data_dir={} checkpoint_dir={} resuming from lsn={redo_lsn}",
        config.data_dir.display(),
        config.checkpoint_dir().display(),
    );

    for slot in manager.control().iter() {
        let state = slot.state();
        if state == undologd::control::SlotState::Unused {
            continue;
        }
        slot.with_meta(|meta| {
            println!(
                "log {:>6}  state={:?}  insert={:<12}  discard={:<12}  end={:<12}",
                slot.logno(),
                state,
                meta.insert,
                meta.discard,
                meta.end,
            );
        });
    }

    Ok(())
}
