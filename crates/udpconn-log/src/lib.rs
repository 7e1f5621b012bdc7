//! Channel-backed `log::Log` implementation.
//!
//! Formatting and `stdout` writes happen on a dedicated thread so that the
//! protocol engine's I/O task never blocks on console output.

use chrono::Local;
use log::{set_boxed_logger, set_max_level, Level, Log, SetLoggerError};
use std::io::{stdout, BufWriter, Write};
use std::sync::mpsc;
use std::thread;

pub enum LogCommand {
    Record(String),
    Flush,
    Terminate,
}

pub struct UdpConnLogger {
    max_level: Level,
    sender: mpsc::SyncSender<LogCommand>,
}

impl UdpConnLogger {
    pub fn new(max_level: Level, buffer_size: usize) -> (Self, mpsc::Receiver<LogCommand>) {
        let (sender, receiver) = mpsc::sync_channel(buffer_size);

        let logger = UdpConnLogger { max_level, sender };
        (logger, receiver)
    }

    pub fn init(max_level: Level) -> Result<(), SetLoggerError> {
        Self::init_with_buffer(max_level, 1024)
    }

    pub fn init_with_buffer(max_level: Level, buffer_size: usize) -> Result<(), SetLoggerError> {
        let (logger, receiver) = UdpConnLogger::new(max_level, buffer_size);

        let _handle = thread::Builder::new()
            .name("udpconn-log-writer".into())
            .spawn(move || {
                let mut writer = BufWriter::new(stdout());
                while let Ok(command) = receiver.recv() {
                    match command {
                        LogCommand::Record(message) => {
                            if let Err(e) = writer.write_all(message.as_bytes()) {
                                eprintln!("[udpconn-log] failed to write log record: {e}");
                            }
                        }
                        LogCommand::Flush => {
                            if let Err(e) = writer.flush() {
                                eprintln!("[udpconn-log] failed to flush log: {e}");
                            }
                        }
                        LogCommand::Terminate => {
                            let _ = writer.flush();
                            break;
                        }
                    }
                }
                let _ = writer.flush();
            })
            .expect("failed to spawn log writer thread");

        set_boxed_logger(Box::new(logger))?;
        set_max_level(max_level.to_level_filter());
        Ok(())
    }
}

impl Log for UdpConnLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let now = Local::now();
            let message = format!(
                "{} {} [{}] {}\n",
                now.format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            );

            if let Err(e) = self.sender.try_send(LogCommand::Record(message)) {
                eprintln!("[udpconn-log] failed to send log message: {e}");
            }
        }
    }

    fn flush(&self) {
        let _ = self.sender.send(LogCommand::Flush);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_level_is_filtered() {
        let (logger, _receiver) = UdpConnLogger::new(Level::Info, 4);
        let metadata = log::MetadataBuilder::new().level(Level::Debug).build();
        assert!(!logger.enabled(&metadata));

        let metadata = log::MetadataBuilder::new().level(Level::Warn).build();
        assert!(logger.enabled(&metadata));
    }
}
