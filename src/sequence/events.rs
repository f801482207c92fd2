use std::fmt;

use serde::Serialize;

/// One observation of a sequence's structure, as reported by
/// `generate_events`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Header {
        size: usize,
        max_size: usize,
        index_size: usize,
        columns: usize,
    },
    Level {
        level: usize,
        start: usize,
        size: usize,
    },
    Column {
        column: usize,
        data_size: usize,
    },
    IndexCell {
        column: usize,
        cell: usize,
        lanes: Vec<u64>,
    },
    Value {
        column: usize,
        idx: usize,
        value: u64,
    },
}

impl Event {
    pub fn write_abbrev<W: fmt::Write>(&self, w: &mut W) -> fmt::Result {
        match self {
            Event::Header {
                size,
                max_size,
                index_size,
                columns,
            } => {
                write!(
                    w,
                    "Header(size={}, max_size={}, index_size={}, columns={})",
                    size, max_size, index_size, columns
                )?;
            }
            Event::Level { level, start, size } => {
                write!(w, "Level({}, start={}, size={})", level, start, size)?;
            }
            Event::Column { column, data_size } => {
                write!(w, "Column({}, data_size={})", column, data_size)?;
            }
            Event::IndexCell {
                column,
                cell,
                lanes,
            } => {
                write!(w, "Cell({}, {}, {:?})", column, cell, lanes)?;
            }
            Event::Value { column, idx, value } => {
                write!(w, "Value({}, {}, {})", column, idx, value)?;
            }
        }
        Ok(())
    }
}

pub trait EventHandler {
    fn event(&mut self, event: Event);
}

/// Collects events in order.
#[derive(Debug, Default, Clone)]
pub struct EventLog {
    events: Vec<Event>,
}

impl EventLog {
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(&self.events)?)
    }
}

impl EventHandler for EventLog {
    fn event(&mut self, event: Event) {
        self.events.push(event);
    }
}

impl fmt::Display for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for event in &self.events {
            event.write_abbrev(f)?;
            writeln!(f)?;
        }
        Ok(())
    }
}
