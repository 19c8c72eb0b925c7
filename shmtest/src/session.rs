use std::io::{BufRead, Write};

use log::{debug, error, info, warn};
use shared_memory_segment::{Attachment, Error, Limits, Permissions, Segment};

use crate::input::{InputError, Tokens};
use crate::interrupt;

/// Default prompt for the segment size.
pub const SIZE_PROMPT: &str = "Please enter the shared mem segment size to allocate: ";
/// Default prompt for the signal to release the segment.
pub const CONTINUE_PROMPT: &str = "Waiting for you to enter a number and press enter to exit... ";

/// Byte written over the region with `--touch`.
const TOUCH_BYTE: u8 = 0xA5;

/// A source of shared memory segments.
pub trait Facility {
    /// Segment handle.
    type Segment: Allocated;

    /// Allocates a private segment of `size` bytes.
    ///
    /// # Errors
    ///
    /// When the segment cannot be allocated.
    fn allocate(&self, size: usize, permissions: Permissions) -> Result<Self::Segment, Error>;

    /// The system limits, used to explain allocation failures.
    fn limits(&self) -> Option<Limits> {
        None
    }
}

/// An allocated segment.
pub trait Allocated: Sized {
    /// The segment mapped into this process.
    type Region<'segment>: Mapped
    where
        Self: 'segment;

    /// Segment id.
    fn id(&self) -> i32;

    /// Maps the segment.
    ///
    /// # Errors
    ///
    /// When the segment cannot be mapped.
    fn attach(&self) -> Result<Self::Region<'_>, Error>;

    /// Marks the segment for destruction, keeping existing mappings valid until detached.
    ///
    /// # Errors
    ///
    /// When the segment cannot be destroyed.
    fn remove(&self) -> Result<(), Error>;

    /// Marks the segment for destruction unless [`Allocated::remove`] already did.
    ///
    /// # Errors
    ///
    /// When the segment cannot be destroyed.
    fn release(self) -> Result<(), Error>;
}

/// A mapped region.
pub trait Mapped: Sized {
    /// Base address.
    fn address(&self) -> usize;

    /// Writes `byte` over the whole region.
    fn fill(&mut self, byte: u8);

    /// Unmaps the region.
    ///
    /// # Errors
    ///
    /// When the region cannot be unmapped.
    fn detach(self) -> Result<(), Error>;
}

/// System V shared memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemV;

impl Facility for SystemV {
    type Segment = Segment;

    fn allocate(&self, size: usize, permissions: Permissions) -> Result<Segment, Error> {
        Segment::allocate(size, permissions)
    }

    fn limits(&self) -> Option<Limits> {
        Limits::read().ok()
    }
}

impl Allocated for Segment {
    type Region<'segment> = Attachment<'segment>;

    fn id(&self) -> i32 {
        Segment::id(self)
    }

    fn attach(&self) -> Result<Attachment<'_>, Error> {
        Segment::attach(self)
    }

    fn remove(&self) -> Result<(), Error> {
        Segment::remove(self)
    }

    fn release(self) -> Result<(), Error> {
        Segment::release(self)
    }
}

impl Mapped for Attachment<'_> {
    fn address(&self) -> usize {
        Attachment::address(self)
    }

    fn fill(&mut self, byte: u8) {
        Attachment::fill(self, byte);
    }

    fn detach(self) -> Result<(), Error> {
        Attachment::detach(self)
    }
}

/// Text shown to the operator before each read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompts {
    /// Shown before reading the size.
    pub size: String,
    /// Shown before waiting for the signal to release the segment.
    pub proceed: String,
}

impl Default for Prompts {
    fn default() -> Self {
        Self {
            size: String::from(SIZE_PROMPT),
            proceed: String::from(CONTINUE_PROMPT),
        }
    }
}

/// Error type for [`Session::run`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The segment could not be allocated.
    #[error("Allocation denied: {0}")]
    AllocationDenied(Error),
    /// The segment was allocated but could not be mapped. It has been released.
    #[error("Attach denied: {0}")]
    AttachDenied(Error),
    /// The size could not be read.
    #[error("Invalid input: {0}")]
    InvalidInput(#[from] InputError),
    /// Detaching or destroying the segment failed.
    #[error("Cleanup failed: {0}")]
    Cleanup(Error),
    /// Failed to write to the operator.
    #[error("Failed to write output: {0}")]
    Output(#[from] std::io::Error),
}

impl SessionError {
    /// Process exit status for this error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match *self {
            Self::AllocationDenied(_) => 1,
            Self::AttachDenied(_) => 2,
            Self::InvalidInput(_) => 3,
            Self::Cleanup(_) => 4,
            Self::Output(_) => 5,
        }
    }
}

/// What a successful session allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    /// Size in bytes.
    pub size: usize,
    /// Segment id.
    pub id: i32,
}

/// One allocate, attach, wait, release probe.
#[derive(Debug)]
pub struct Session<F> {
    /// Where segments come from.
    facility: F,
    /// Prompt wording.
    prompts: Prompts,
    /// Permissions of the allocated segment.
    permissions: Permissions,
    /// Whether to write the whole region before waiting.
    touch: bool,
}

impl<F: Facility> Session<F> {
    /// A session allocating from `facility`.
    pub fn new(facility: F, prompts: Prompts) -> Self {
        Self {
            facility,
            prompts,
            permissions: Permissions::default(),
            touch: false,
        }
    }

    /// Sets the permissions of the allocated segment.
    #[must_use]
    pub const fn permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = permissions;
        self
    }

    /// Sets whether to write the whole region before waiting.
    #[must_use]
    pub const fn touch(mut self, touch: bool) -> Self {
        self.touch = touch;
        self
    }

    /// Runs the probe.
    ///
    /// When `size` is `None` it is read from `input`. Whatever happens, no segment is left
    /// allocated when this returns.
    ///
    /// # Errors
    ///
    /// See [`SessionError`]; each variant maps to a distinct exit status.
    pub fn run<R: BufRead, W: Write>(
        &self,
        input: &mut Tokens<R>,
        output: &mut W,
        size: Option<usize>,
    ) -> Result<Report, SessionError> {
        let size = match size {
            Some(size) => size,
            None => self.read_size(input, output)?,
        };

        let allocated = interrupt::track_with(
            || self.facility.allocate(size, self.permissions),
            |segment: &F::Segment| segment.id(),
        );
        let (segment, tracked) = match allocated {
            Ok(allocated) => allocated,
            Err(err) => {
                writeln!(output, "Looks like we cannot allocate {} bytes, sorry.", size)?;
                self.explain(size);
                return Err(SessionError::AllocationDenied(err));
            }
        };
        let id = segment.id();

        // The segment is released whether or not holding it succeeded.
        let held = self.hold(&segment, size, input, output);
        let released = tracked.release_with(|| segment.release());
        match (held, released) {
            (Ok(()), Ok(())) => {}
            (Ok(()), Err(err)) => return Err(SessionError::Cleanup(err)),
            (Err(err), Ok(())) => return Err(err),
            (Err(err), Err(release_err)) => {
                error!("{}", release_err);
                return Err(err);
            }
        }

        writeln!(output, "Done.")?;
        output.flush()?;
        Ok(Report { size, id })
    }

    /// Attaches `segment`, waits for the operator, then detaches.
    fn hold<S: Allocated, R: BufRead, W: Write>(
        &self,
        segment: &S,
        size: usize,
        input: &mut Tokens<R>,
        output: &mut W,
    ) -> Result<(), SessionError> {
        let id = segment.id();
        let mut region = match segment.attach() {
            Ok(region) => region,
            Err(err) => {
                writeln!(output, "Looks like we cannot attach to shared mem seg {}, sorry.", id)?;
                return Err(SessionError::AttachDenied(err));
            }
        };
        debug!("shmid {} mapped at {:#x}", id, region.address());

        writeln!(output, "Allocated {} bytes on segment id {}\n", size, id)?;
        if self.touch {
            // Touching can get us killed (`SIGBUS`, OOM killer) where no handler runs, so let the
            // kernel free the segment on detach whatever happens.
            if let Err(err) = segment.remove() {
                warn!("{}", err);
            }
            info!("touching {} bytes", size);
            region.fill(TOUCH_BYTE);
        }

        write!(output, "{}", self.prompts.proceed)?;
        output.flush()?;
        match input.next_token() {
            Ok(Some(token)) if token.parse::<i64>().is_err() => {
                warn!("{:?} is not a number, releasing anyway", token);
            }
            Ok(Some(_)) => {}
            Ok(None) => info!("input ended, releasing"),
            Err(err) => warn!("failed to read input, releasing: {}", err),
        }

        region.detach().map_err(SessionError::Cleanup)
    }

    /// Prompts for and reads the size.
    fn read_size<R: BufRead, W: Write>(
        &self,
        input: &mut Tokens<R>,
        output: &mut W,
    ) -> Result<usize, SessionError> {
        write!(output, "{}", self.prompts.size)?;
        output.flush()?;
        match input.next_size() {
            Ok(size) => Ok(size),
            Err(InputError::Parse(err)) => {
                writeln!(output, "\nLooks like {:?} is not a number of bytes, sorry.", err.0)?;
                Err(SessionError::InvalidInput(InputError::Parse(err)))
            }
            Err(err) => {
                writeln!(output)?;
                Err(SessionError::InvalidInput(err))
            }
        }
    }

    /// Logs why an allocation of `size` bytes was likely refused.
    fn explain(&self, size: usize) {
        if let Some(limits) = self.facility.limits() {
            if limits.exceeds_max_segment_size(size) {
                warn!(
                    "{} bytes exceeds kernel.shmmax ({} bytes)",
                    size, limits.max_segment_size
                );
            }
        }
    }
}
