use crate::backend::{CompletionToken, RemoteBuffer};
use crate::device::CopyFence;
use crate::error::Result;
use crate::mapper::Mapper;
use std::sync::Arc;

enum Pending {
    Backend(Arc<CompletionToken>),
    Copy(Box<dyn CopyFence>),
    Done,
}

/// A handle to one in-flight mapper operation.
///
/// The request borrows the mapper that issued it, so the mapper cannot be
/// torn down while requests are outstanding. Nothing advances on its own:
/// [`test`](Self::test) drives the mapper's progress loop once and then
/// checks completion, [`wait`](Self::wait) spins on `test`.
///
/// For puts, completion means the source buffer may be reused. Remote
/// visibility is only established through
/// [`Mapper::check_notify`] on the receiving rank.
pub struct Request<'m> {
    mapper: &'m Mapper,
    pending: Pending,
    remote: Option<RemoteBuffer>,
}

impl<'m> Request<'m> {
    pub(crate) fn backend(mapper: &'m Mapper, token: Arc<CompletionToken>) -> Self {
        Self {
            mapper,
            pending: Pending::Backend(token),
            remote: None,
        }
    }

    pub(crate) fn copy(mapper: &'m Mapper, fence: Box<dyn CopyFence>) -> Self {
        Self {
            mapper,
            pending: Pending::Copy(fence),
            remote: None,
        }
    }

    /// Drive progress once and report whether the operation has completed.
    ///
    /// A failed operation returns its error exactly once; later calls report
    /// `Ok(true)`.
    pub fn test(&mut self) -> Result<bool> {
        if matches!(self.pending, Pending::Done) {
            return Ok(true);
        }
        self.mapper.progress()?;
        let complete = match &self.pending {
            Pending::Backend(token) => {
                if !token.is_complete() {
                    return Ok(false);
                }
                self.remote = token.remote();
                if let Some(err) = token.take_error() {
                    self.pending = Pending::Done;
                    return Err(err);
                }
                true
            }
            Pending::Copy(fence) => match fence.is_complete() {
                Ok(done) => done,
                Err(err) => {
                    self.pending = Pending::Done;
                    return Err(err);
                }
            },
            Pending::Done => true,
        };
        if complete {
            self.pending = Pending::Done;
        }
        Ok(complete)
    }

    /// Spin until the operation completes and propagate its error.
    pub fn wait(&mut self) -> Result<()> {
        while !self.test()? {
            std::hint::spin_loop();
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.pending, Pending::Done)
    }

    /// The peer buffer announced by a completed control receive.
    pub fn remote_buffer(&self) -> Option<RemoteBuffer> {
        self.remote
    }
}

/// Requests that are waited on together.
#[derive(Default)]
pub struct RequestGroup<'m> {
    requests: Vec<Request<'m>>,
}

impl<'m> RequestGroup<'m> {
    pub fn new() -> Self {
        Self {
            requests: Vec::new(),
        }
    }

    pub fn push(&mut self, req: Request<'m>) {
        self.requests.push(req);
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Wait for every request in the group.
    ///
    /// Returns the first error encountered. All requests are waited on
    /// regardless of errors.
    pub fn wait_all(self) -> Result<Vec<Request<'m>>> {
        let mut first_err = None;
        let mut done = Vec::with_capacity(self.requests.len());
        for mut req in self.requests {
            if let Err(e) = req.wait()
                && first_err.is_none()
            {
                first_err = Some(e);
            }
            done.push(req);
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(done),
        }
    }
}
