use std::{
    fmt::{self, Write as _},
    fs::File,
    io::Write,
    os::fd::{FromRawFd, RawFd},
    sync::Arc,
};

use serde::Serialize;
use tracing::{
    error,
    field::{Field, Visit},
    span, Event, Level, Subscriber,
};
use tracing_subscriber::{layer::Context, prelude::*, registry::LookupSpan, Layer};

use crate::env::BootstrapEnv;

/// Label used for events that happen outside any stage span.
pub const DEFAULT_STAGE: &str = "nsexec";

/// Same numbering as logrus, which is what the log pipe reader speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Panic = 0,
    Fatal = 1,
    Error = 2,
    Warning = 3,
    Info = 4,
    Debug = 5,
    Trace = 6,
}

impl LogLevel {
    pub fn from_logrus(level: u32) -> Self {
        match level {
            0 => Self::Panic,
            1 => Self::Fatal,
            2 => Self::Error,
            3 => Self::Warning,
            4 => Self::Info,
            5 => Self::Debug,
            _ => Self::Trace,
        }
    }

    fn from_tracing(level: &Level, fatal: bool) -> Self {
        match *level {
            Level::ERROR if fatal => Self::Fatal,
            Level::ERROR => Self::Error,
            Level::WARN => Self::Warning,
            Level::INFO => Self::Info,
            Level::DEBUG => Self::Debug,
            Level::TRACE => Self::Trace,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Panic => "panic",
            Self::Fatal => "fatal",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

#[derive(Serialize)]
struct Entry<'a> {
    level: &'a str,
    msg: String,
}

/// One JSON object per line. serde_json takes care of escaping control chars.
pub fn render_entry(level: LogLevel, stage: &str, pid: u32, message: &str) -> String {
    let entry = Entry {
        level: level.name(),
        msg: format!("{}[{}]: {}", stage, pid, message),
    };
    // serializing a struct of strings can't fail
    let mut line = serde_json::to_string(&entry).unwrap_or_default();
    line.push('\n');
    line
}

/// Write end of the log pipe supplied by the parent.
#[derive(Clone)]
pub struct LogPipe(Arc<File>);

impl LogPipe {
    /// # Safety
    /// `fd` must be an open descriptor that nothing else owns.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        LogPipe(Arc::new(File::from_raw_fd(fd)))
    }

    pub fn new(file: File) -> Self {
        LogPipe(Arc::new(file))
    }

    /// Best effort: there is nothing useful to do about a short or failed write.
    pub fn write_entry(&self, level: LogLevel, stage: &str, message: &str) {
        let line = render_entry(level, stage, std::process::id(), message);
        let _ = (&*self.0).write(line.as_bytes());
    }
}

struct StageLabel(String);

#[derive(Default)]
struct EventVisitor {
    message: String,
    fields: String,
    stage: Option<String>,
    fatal: bool,
}

impl Visit for EventVisitor {
    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == "fatal" {
            self.fatal = value;
        } else {
            self.record_debug(field, &value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message.push_str(value),
            "stage" => self.stage = Some(value.to_string()),
            name => {
                let _ = write!(self.fields, " {}={}", name, value);
            }
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => {
                let _ = write!(self.message, "{:?}", value);
            }
            "stage" => self.stage = Some(format!("{:?}", value)),
            name => {
                let _ = write!(self.fields, " {}={:?}", name, value);
            }
        }
    }
}

/// Forwards tracing events to the log pipe as JSON lines tagged with the
/// innermost `stage` span field.
pub struct LogPipeLayer {
    pipe: LogPipe,
    max_level: LogLevel,
}

impl LogPipeLayer {
    pub fn new(pipe: LogPipe, max_level: LogLevel) -> Self {
        LogPipeLayer { pipe, max_level }
    }
}

impl<S> Layer<S> for LogPipeLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = EventVisitor::default();
        attrs.record(&mut visitor);
        if let (Some(stage), Some(span)) = (visitor.stage, ctx.span(id)) {
            span.extensions_mut().insert(StageLabel(stage));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);

        let level = LogLevel::from_tracing(event.metadata().level(), visitor.fatal);
        if level > self.max_level {
            return;
        }

        let stage = ctx
            .event_scope(event)
            .and_then(|scope| {
                scope
                    .into_iter()
                    .find_map(|span| span.extensions().get::<StageLabel>().map(|s| s.0.clone()))
            })
            .unwrap_or_else(|| DEFAULT_STAGE.to_string());

        visitor.message.push_str(&visitor.fields);
        self.pipe.write_entry(level, &stage, &visitor.message);
    }
}

/// Installs the log pipe subscriber if the parent gave us a pipe.
pub fn init(env: &BootstrapEnv) -> Option<LogPipe> {
    let fd = env.log_pipe?;
    let pipe = unsafe { LogPipe::from_raw_fd(fd) };
    let max_level = env
        .log_level
        .map(LogLevel::from_logrus)
        .unwrap_or(LogLevel::Debug);

    // a subscriber may already exist (e.g. in tests); keep it
    let _ = tracing_subscriber::registry()
        .with(LogPipeLayer::new(pipe.clone(), max_level))
        .try_init();
    Some(pipe)
}

/// Reports a fatal error and terminates the process.
pub fn fatal(pipe: Option<&LogPipe>, err: &anyhow::Error) -> ! {
    match pipe {
        Some(_) => error!(fatal = true, "{:#}", err),
        None => eprintln!("FATAL: {:#}", err),
    }
    std::process::exit(1);
}

#[cfg(test)]
mod test {
    use std::io::Read;
    use std::os::unix::net::UnixStream;

    use tracing::{debug, info_span, trace};

    use super::*;

    #[test]
    fn renders_json_line() {
        let line = render_entry(LogLevel::Debug, "nsexec-1", 42, "say \"hi\"\n\tnow\x01");
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["level"], "debug");
        assert_eq!(value["msg"], "nsexec-1[42]: say \"hi\"\n\tnow\x01");
        assert!(!line.trim_end().contains('\n'));
        assert!(line.contains("\\u0001"));
    }

    #[test]
    fn logrus_levels() {
        assert_eq!(LogLevel::from_logrus(0), LogLevel::Panic);
        assert_eq!(LogLevel::from_logrus(5), LogLevel::Debug);
        assert_eq!(LogLevel::from_logrus(99), LogLevel::Trace);
        assert_eq!(LogLevel::Warning.name(), "warning");
    }

    #[test]
    fn layer_tags_events_with_stage() {
        let (mut reader, writer) = UnixStream::pair().unwrap();
        let pipe = LogPipe::new(File::from(std::os::fd::OwnedFd::from(writer)));
        let subscriber =
            tracing_subscriber::registry().with(LogPipeLayer::new(pipe, LogLevel::Debug));

        tracing::subscriber::with_default(subscriber, || {
            debug!("outside");
            let _span = info_span!("nsexec", stage = "nsexec-2").entered();
            debug!(ns = "net", "joined");
            // filtered out by max level
            trace!("noisy");
            error!(fatal = true, "boom");
        });

        // the subscriber, and with it the writer, is gone by now
        let mut text = String::new();
        reader.read_to_string(&mut text).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        let pid = std::process::id();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["msg"], format!("nsexec[{}]: outside", pid));
        assert_eq!(lines[1]["level"], "debug");
        assert_eq!(lines[1]["msg"], format!("nsexec-2[{}]: joined ns=net", pid));
        assert_eq!(lines[2]["level"], "fatal");
    }
}
