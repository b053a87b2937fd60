//! Test-only helpers: section builders, synthetic pages, scripted oracles.

use std::cell::RefCell;
use std::collections::VecDeque;

use anyhow::{Result, anyhow};
use serde_json::Value;

use crate::io::oracle::{Oracle, OracleReply, OracleRequest, ToolExchange};
use crate::pages::{Page, PageSet};
use crate::tree::Section;

/// Create a deterministic section with no range and no children.
pub fn section(id: &str, title: &str, level: u32) -> Section {
    Section::new(id, title, level)
}

/// Create a deterministic section with an explicit page range.
pub fn section_with_range(id: &str, title: &str, level: u32, start: u32, end: u32) -> Section {
    let mut node = Section::new(id, title, level);
    node.page_start = Some(start);
    node.page_end = Some(end);
    node
}

/// Build a page set from explicit `(page_number, content)` pairs.
pub fn pages_from(specs: &[(u32, &str)]) -> PageSet {
    PageSet::new(
        specs
            .iter()
            .map(|(number, content)| Page {
                page_number: *number,
                content: (*content).to_string(),
            })
            .collect(),
    )
}

/// Build `count` pages numbered from 1, each padded to `chars_per_page` bytes
/// of content beginning with "page N body".
pub fn synthetic_pages(count: u32, chars_per_page: usize) -> PageSet {
    PageSet::new(
        (1..=count)
            .map(|number| {
                let mut content = format!("page {number} body ");
                while content.len() < chars_per_page {
                    content.push('x');
                }
                content.truncate(chars_per_page);
                Page {
                    page_number: number,
                    content,
                }
            })
            .collect(),
    )
}

#[derive(Debug, Clone)]
enum ScriptedReply {
    Reply(OracleReply),
    Failure(String),
}

/// Oracle double that returns a scripted reply sequence and records every
/// request it sees.
pub struct ScriptedOracle {
    replies: RefCell<VecDeque<ScriptedReply>>,
    fallback: Option<ScriptedReply>,
    requests: RefCell<Vec<OracleRequest>>,
    transcripts: RefCell<Vec<Vec<ToolExchange>>>,
}

impl ScriptedOracle {
    /// Replies consumed in order; an exhausted script is an error.
    pub fn new(replies: Vec<Result<OracleReply>>) -> Self {
        Self {
            replies: RefCell::new(
                replies
                    .into_iter()
                    .map(|reply| match reply {
                        Ok(reply) => ScriptedReply::Reply(reply),
                        Err(err) => ScriptedReply::Failure(format!("{err:#}")),
                    })
                    .collect(),
            ),
            fallback: None,
            requests: RefCell::new(Vec::new()),
            transcripts: RefCell::new(Vec::new()),
        }
    }

    /// Structured outputs consumed in order.
    pub fn structured(values: Vec<Value>) -> Self {
        Self::new(
            values
                .into_iter()
                .map(|value| Ok(OracleReply::Structured(value)))
                .collect(),
        )
    }

    /// The same reply for every call, forever.
    pub fn repeating(reply: OracleReply) -> Self {
        Self {
            replies: RefCell::new(VecDeque::new()),
            fallback: Some(ScriptedReply::Reply(reply)),
            requests: RefCell::new(Vec::new()),
            transcripts: RefCell::new(Vec::new()),
        }
    }

    /// Every request recorded so far.
    pub fn requests(&self) -> Vec<OracleRequest> {
        self.requests.borrow().clone()
    }

    /// Transcript length seen by each call, in call order.
    pub fn transcript_lengths(&self) -> Vec<usize> {
        self.transcripts
            .borrow()
            .iter()
            .map(Vec::len)
            .collect()
    }

    /// The transcript seen by the most recent call.
    pub fn last_transcript(&self) -> Option<Vec<ToolExchange>> {
        self.transcripts.borrow().last().cloned()
    }
}

impl Oracle for ScriptedOracle {
    fn infer(&self, request: &OracleRequest, transcript: &[ToolExchange]) -> Result<OracleReply> {
        self.requests.borrow_mut().push(request.clone());
        self.transcripts.borrow_mut().push(transcript.to_vec());
        let scripted = self
            .replies
            .borrow_mut()
            .pop_front()
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| anyhow!("scripted oracle ran out of replies"))?;
        match scripted {
            ScriptedReply::Reply(reply) => Ok(reply),
            ScriptedReply::Failure(message) => Err(anyhow!(message)),
        }
    }
}
