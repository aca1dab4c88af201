//! Surveyor/Respondent protocols.
//!
//! A survey is a broadcast question with a bounded answer window. The
//! surveyor stamps each survey with a fresh 4-byte id; responses carrying
//! any other id are ignored, and once `surveyor:survey-time` elapses every
//! further receive reports `Timeout` until the next survey opens. Opening a
//! new survey discards responses still queued for the old one.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

use super::{
    broadcast, frame_with_header, ids, peek_u32_be, queue_recv, CallMode, PipeList, Protocol,
};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::options::{names, OptionValue};
use crate::pipe::Pipe;
use crate::queue::MsgQueue;
use crate::socket::Socket;

/// Default survey window, milliseconds.
const DEFAULT_SURVEY_MS: i32 = 1000;

#[derive(Clone, Copy)]
struct Survey {
    id: u32,
    deadline: Instant,
}

struct SurveyorProto {
    pipes: PipeList,
    next_id: AtomicU32,
    survey_ms: Mutex<i32>,
    current: Mutex<Option<Survey>>,
    replies: MsgQueue<Message>,
    closed: AtomicBool,
}

impl SurveyorProto {
    fn new(recv_buffer: usize) -> Self {
        SurveyorProto {
            pipes: PipeList::new(),
            next_id: AtomicU32::new(rand::thread_rng().gen()),
            survey_ms: Mutex::new(DEFAULT_SURVEY_MS),
            current: Mutex::new(None),
            replies: MsgQueue::new(recv_buffer),
            closed: AtomicBool::new(false),
        }
    }

    fn window(&self) -> Duration {
        let ms = *self.survey_ms.lock();
        Duration::from_millis(ms.max(0) as u64)
    }
}

#[async_trait]
impl Protocol for SurveyorProto {
    fn id(&self) -> u16 {
        ids::SURVEYOR0
    }

    fn peer_id(&self) -> u16 {
        ids::RESPONDENT0
    }

    fn name(&self) -> &'static str {
        "surveyor"
    }

    fn peer_name(&self) -> &'static str {
        "respondent"
    }

    fn pipe_added(&self, pipe: &Pipe) {
        self.pipes.add(pipe);
    }

    fn pipe_removed(&self, pipe: &Pipe) {
        self.pipes.remove(pipe.id());
    }

    async fn deliver(&self, frame: Vec<u8>, pipe: &Pipe) {
        let Some(id) = peek_u32_be(&frame) else {
            debug!(pipe = pipe.id(), "dropping runt survey response");
            return;
        };
        let current = *self.current.lock();
        match current {
            Some(survey) if survey.id == id && Instant::now() < survey.deadline => {
                let body = frame[4..].to_vec();
                let msg = Message::from_wire(id.to_be_bytes().to_vec(), body, Some(pipe.clone()));
                if self.replies.try_push(msg).is_err() {
                    debug!(survey = id, "response backlog full; dropping");
                }
            }
            _ => debug!(survey = id, "dropping response for expired survey"),
        }
    }

    async fn send(&self, body: Vec<u8>, _pipe: Option<Pipe>, _mode: CallMode) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let id = (self.next_id.fetch_add(1, Ordering::Relaxed) & 0x7FFF_FFFF) | 0x8000_0000;
        // The new survey supersedes the old one wholesale.
        *self.current.lock() = Some(Survey {
            id,
            deadline: Instant::now() + self.window(),
        });
        self.replies.clear();
        let frame = frame_with_header(&id.to_be_bytes(), &body);
        broadcast(&self.pipes.snapshot(), &frame);
        Ok(())
    }

    async fn recv(&self, mode: CallMode) -> Result<Message> {
        let survey = (*self.current.lock()).ok_or(Error::BadState)?;
        if Instant::now() >= survey.deadline {
            return Err(Error::Timeout);
        }
        let mode = match mode {
            CallMode::NonBlocking => CallMode::NonBlocking,
            CallMode::Deadline(deadline) => {
                let capped = deadline
                    .map(|d| d.min(survey.deadline))
                    .unwrap_or(survey.deadline);
                CallMode::Deadline(Some(capped))
            }
        };
        queue_recv(&self.replies, mode).await
    }

    fn resize_recv_buffer(&self, capacity: usize) {
        self.replies.set_capacity(capacity);
    }

    fn set_option(&self, name: &str, value: &OptionValue) -> Result<()> {
        match name {
            names::SURVEYOR_SURVEY_TIME => {
                let ms = value.as_ms()?;
                if ms < 0 {
                    return Err(Error::InvalidOperation);
                }
                *self.survey_ms.lock() = ms;
                Ok(())
            }
            _ => Err(Error::NotSupported),
        }
    }

    fn get_option(&self, name: &str) -> Result<OptionValue> {
        match name {
            names::SURVEYOR_SURVEY_TIME => Ok(OptionValue::Ms(*self.survey_ms.lock())),
            _ => Err(Error::NotSupported),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.replies.close();
        self.pipes.ready.notify_waiters();
    }
}

struct RespondentProto {
    /// Unanswered surveys, oldest first: (survey id bytes, question).
    requests: MsgQueue<(Vec<u8>, Message)>,
    stash: Mutex<Option<(Vec<u8>, Pipe)>>,
    closed: AtomicBool,
}

impl RespondentProto {
    fn new(recv_buffer: usize) -> Self {
        RespondentProto {
            requests: MsgQueue::new(recv_buffer),
            stash: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Protocol for RespondentProto {
    fn id(&self) -> u16 {
        ids::RESPONDENT0
    }

    fn peer_id(&self) -> u16 {
        ids::SURVEYOR0
    }

    fn name(&self) -> &'static str {
        "respondent"
    }

    fn peer_name(&self) -> &'static str {
        "surveyor"
    }

    fn pipe_added(&self, _pipe: &Pipe) {}

    fn pipe_removed(&self, _pipe: &Pipe) {}

    async fn deliver(&self, frame: Vec<u8>, pipe: &Pipe) {
        if peek_u32_be(&frame).is_none() {
            debug!(pipe = pipe.id(), "dropping runt survey");
            return;
        }
        let header = frame[..4].to_vec();
        let body = frame[4..].to_vec();
        let msg = Message::from_wire(Vec::new(), body, Some(pipe.clone()));
        let _ = self.requests.push((header, msg), None).await;
    }

    async fn send(&self, body: Vec<u8>, _pipe: Option<Pipe>, mode: CallMode) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let (header, pipe) = self.stash.lock().take().ok_or(Error::BadState)?;
        if pipe.is_closed() {
            debug!(pipe = pipe.id(), "surveyor vanished; response dropped");
            return Ok(());
        }
        let frame = frame_with_header(&header, &body);
        let outcome = match mode {
            CallMode::NonBlocking => pipe.try_queue_frame(frame).map_err(|_| Error::TryAgain),
            CallMode::Deadline(deadline) => pipe.queue_frame(frame, deadline).await,
        };
        if outcome.is_err() {
            *self.stash.lock() = Some((header, pipe));
        }
        outcome
    }

    async fn recv(&self, mode: CallMode) -> Result<Message> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let (header, msg) = match mode {
            CallMode::NonBlocking => self.requests.try_pop()?.ok_or(Error::TryAgain)?,
            CallMode::Deadline(deadline) => self.requests.pop(deadline).await?,
        };
        let pipe = msg.pipe().cloned().ok_or(Error::Internal)?;
        *self.stash.lock() = Some((header, pipe));
        Ok(msg)
    }

    fn resize_recv_buffer(&self, capacity: usize) {
        self.requests.set_capacity(capacity);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.requests.close();
        self.stash.lock().take();
    }
}

/// Surveyor socket: broadcast questions, gather answers within a window.
pub struct Surveyor0 {
    socket: Socket,
}

impl Surveyor0 {
    pub fn open() -> Result<Surveyor0> {
        let recv_buffer = crate::defaults::RECV_BUFFER;
        let socket = Socket::open(Box::new(SurveyorProto::new(recv_buffer)))?;
        Ok(Surveyor0 { socket })
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    /// Set the answer window for subsequent surveys.
    pub fn set_survey_time(&self, window: Duration) -> Result<()> {
        let ms = window.as_millis().min(i32::MAX as u128) as i32;
        self.socket
            .set_option(names::SURVEYOR_SURVEY_TIME, OptionValue::Ms(ms))
    }
}

impl Deref for Surveyor0 {
    type Target = Socket;

    fn deref(&self) -> &Socket {
        &self.socket
    }
}

/// Respondent socket: answer surveys one at a time.
pub struct Respondent0 {
    socket: Socket,
}

impl Respondent0 {
    pub fn open() -> Result<Respondent0> {
        let recv_buffer = crate::defaults::RECV_BUFFER;
        let socket = Socket::open(Box::new(RespondentProto::new(recv_buffer)))?;
        Ok(Respondent0 { socket })
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }
}

impl Deref for Respondent0 {
    type Target = Socket;

    fn deref(&self) -> &Socket {
        &self.socket
    }
}
