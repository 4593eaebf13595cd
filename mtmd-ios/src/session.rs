//! Session lifecycle: create, prefill, generate, reset

use std::path::Path;

use image::RgbImage;
use tracing::{debug, info, trace, warn};

use crate::chat::Role;
use crate::engine::{Capability, Engine, EngineError};
use crate::error::SessionError;
use crate::media;
use crate::params::SessionParams;
use crate::sampling::Sampler;
use crate::token::{PieceDecoder, Token, TokenId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// No fresh logits: nothing prefilled since creation, a reset or a failed evaluation
    Idle,
    /// Logits for the last position are fresh
    Ready,
    /// The current turn has ended
    Finished,
}

/// A multimodal inference session
///
/// Prefill calls append to the running context in call order. Generation is
/// pulled one token at a time with [`Session::next_token`] or lazily through
/// [`Session::tokens`]; to cancel, stop pulling and drop the session.
///
/// A session is used from one thread at a time. Independent sessions own
/// disjoint engine resources.
pub struct Session {
    engine: Box<dyn Engine>,
    sampler: Sampler,
    decoder: PieceDecoder,
    prediction_limit: Option<usize>,
    n_ctx: usize,
    n_past: usize,
    n_generated: usize,
    state: State,
}

impl Session {
    /// Load the model and projector named in `params`
    ///
    /// # Errors
    ///
    /// Fails when a parameter is out of range, a file is missing or
    /// unreadable, the backend cannot load the files, or no backend is
    /// compiled in.
    pub fn new(params: &SessionParams) -> Result<Self, SessionError> {
        params.validate()?;
        ensure_readable("Model", &params.model_path)?;
        ensure_readable("Projector", &params.mmproj_path)?;
        let engine = default_engine(params)?;
        Self::with_engine(params, engine)
    }

    /// Wrap an already loaded engine
    ///
    /// The paths in `params` are ignored; generation settings and warmup apply.
    ///
    /// # Errors
    ///
    /// Fails when a parameter is out of range or warmup fails.
    pub fn with_engine(
        params: &SessionParams,
        mut engine: Box<dyn Engine>,
    ) -> Result<Self, SessionError> {
        params.validate()?;
        if params.warmup {
            engine.warmup()?;
        }
        // the engine may round its window up
        let n_ctx = usize::try_from(params.n_ctx)
            .unwrap_or(usize::MAX)
            .min(engine.n_ctx());
        info!(
            n_ctx,
            engine_n_ctx = engine.n_ctx(),
            n_predict = params.n_predict,
            temperature = params.temperature,
            "session ready"
        );
        Ok(Self {
            engine,
            sampler: Sampler::new(params.temperature, params.seed),
            decoder: PieceDecoder::new(),
            prediction_limit: params.prediction_limit(),
            n_ctx,
            n_past: 0,
            n_generated: 0,
            state: State::Idle,
        })
    }

    /// Positions currently occupied in the context
    pub fn n_past(&self) -> usize {
        self.n_past
    }

    /// Size of the context window: the configured size, or the engine's when smaller
    pub fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    /// Whether the current turn has ended
    pub fn is_finished(&self) -> bool {
        self.state != State::Ready
    }

    /// Append an image to the context
    ///
    /// # Errors
    ///
    /// Fails when the projector has no vision support, the file is not a
    /// readable image, the image does not fit, or evaluation fails. The
    /// context keeps its previous contents.
    pub fn prefill_image(&mut self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        self.ensure_vision()?;
        let image = media::load_image(path.as_ref())?;
        self.prefill_rgb(&image)
    }

    /// Append a video frame, downscaled to [`media::FRAME_MAX_EDGE`]
    ///
    /// # Errors
    ///
    /// Same as [`Session::prefill_image`].
    pub fn prefill_frame(&mut self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        self.ensure_vision()?;
        let frame = media::load_frame(path.as_ref())?;
        self.prefill_rgb(&frame)
    }

    /// Append already decoded pixels
    ///
    /// # Errors
    ///
    /// Same as [`Session::prefill_image`], minus file errors.
    pub fn prefill_pixels(&mut self, image: &RgbImage) -> Result<(), SessionError> {
        self.ensure_vision()?;
        self.prefill_rgb(image)
    }

    /// Append a chat turn
    ///
    /// The text is formatted with the model's chat template; a
    /// [`Role::User`] turn also opens the assistant reply.
    ///
    /// # Errors
    ///
    /// Fails when templating or tokenization fails, the tokens do not fit,
    /// or evaluation fails. The context keeps its previous contents.
    pub fn prefill_text(&mut self, text: &str, role: Role) -> Result<(), SessionError> {
        let formatted = self
            .engine
            .format_chat(role, text, role.opens_generation())?;
        let tokens = self.engine.tokenize(&formatted, self.n_past == 0)?;
        if tokens.is_empty() {
            return Ok(());
        }
        self.ensure_capacity(tokens.len())?;

        if let Err(err) = self.engine.eval_tokens(&tokens, self.n_past) {
            return Err(self.rollback(err));
        }
        let from = self.n_past;
        self.n_past += tokens.len();
        self.begin_turn();
        debug!(%role, from, to = self.n_past, "prefilled text");
        Ok(())
    }

    /// Generate one token
    ///
    /// Returns an end token (`is_end`) when the model emits an
    /// end-of-generation token, the prediction limit is reached, or nothing
    /// has been prefilled. A prefill that leaves no logits behind, such as an
    /// image the engine embedded without outputs, also ends the turn. Once
    /// ended, every call returns an end token until more context is prefilled.
    ///
    /// # Errors
    ///
    /// Sampling or evaluation failures end the turn and are returned once.
    pub fn next_token(&mut self) -> Result<Token, SessionError> {
        match self.state {
            State::Idle => return Ok(Token::end(String::new(), 0)),
            State::Finished => return Ok(Token::end(String::new(), self.n_generated)),
            State::Ready => {}
        }
        if self
            .prediction_limit
            .is_some_and(|limit| self.n_generated >= limit)
        {
            debug!(n_generated = self.n_generated, "prediction limit reached");
            return Ok(self.finish());
        }

        let token = match self.engine.logits() {
            Ok(logits) => self.sampler.sample(logits).map_err(SessionError::from),
            Err(EngineError::NoLogits) => {
                debug!(n_past = self.n_past, "no logits after the last prefill");
                return Ok(self.finish());
            }
            Err(err) => Err(err.into()),
        };
        let token = match token {
            Ok(token) => token,
            Err(err) => return Err(self.abort(err)),
        };
        if self.engine.is_end_of_generation(token) {
            debug!(token, n_generated = self.n_generated, "end of generation");
            return Ok(self.finish());
        }

        match self.step(token) {
            Ok(piece) => {
                let index = self.n_generated;
                self.n_generated += 1;
                let text = self.decoder.push(&piece);
                trace!(token, index, text = %text, "generated");
                Ok(Token {
                    text,
                    is_end: false,
                    index,
                })
            }
            Err(err) => Err(self.abort(err)),
        }
    }

    /// Lazily pull generated text until the turn ends
    ///
    /// Empty pieces are skipped. An error is yielded once and ends the stream.
    pub fn tokens(&mut self) -> Tokens<'_> {
        Tokens {
            session: self,
            done: false,
        }
    }

    /// Forget the whole context and start over
    pub fn clear(&mut self) {
        self.engine.truncate(0);
        self.sampler.reset();
        self.decoder.reset();
        self.n_past = 0;
        self.n_generated = 0;
        self.state = State::Idle;
        info!("context cleared");
    }

    fn step(&mut self, token: TokenId) -> Result<Vec<u8>, SessionError> {
        self.ensure_capacity(1)?;
        let piece = self.engine.token_to_piece(token)?;
        if let Err(err) = self.engine.eval_tokens(&[token], self.n_past) {
            return Err(self.rollback(err));
        }
        self.n_past += 1;
        Ok(piece)
    }

    fn prefill_rgb(&mut self, image: &RgbImage) -> Result<(), SessionError> {
        let from = self.n_past;
        let to = match self.engine.eval_image(image, from, self.n_ctx) {
            Ok(to) => to,
            Err(err) => return Err(self.rollback(err)),
        };
        if to < from {
            self.engine.truncate(from);
            self.state = State::Idle;
            return Err(EngineError::ImageEval(format!(
                "engine moved the position backwards from {from} to {to}"
            ))
            .into());
        }
        self.n_past = to;
        self.begin_turn();
        debug!(
            width = image.width(),
            height = image.height(),
            from,
            to,
            "prefilled image"
        );
        Ok(())
    }

    fn ensure_vision(&self) -> Result<(), SessionError> {
        if self.engine.capabilities().contains(Capability::Vision) {
            Ok(())
        } else {
            Err(SessionError::VisionUnsupported)
        }
    }

    fn ensure_capacity(&self, needed: usize) -> Result<(), SessionError> {
        let available = self.n_ctx.saturating_sub(self.n_past);
        if needed > available {
            return Err(SessionError::ContextFull { needed, available });
        }
        Ok(())
    }

    fn begin_turn(&mut self) {
        self.n_generated = 0;
        self.decoder.reset();
        self.state = State::Ready;
    }

    /// Undo a failed evaluation so the next call sees the old context
    fn rollback(&mut self, err: EngineError) -> SessionError {
        if !matches!(err, EngineError::ContextFull { .. }) {
            // the engine may have written cells and replaced its logits
            self.engine.truncate(self.n_past);
            self.state = State::Idle;
        }
        warn!(n_past = self.n_past, error = %err, "evaluation failed");
        err.into()
    }

    fn abort(&mut self, err: SessionError) -> SessionError {
        if self.state == State::Ready {
            self.state = State::Finished;
        }
        self.decoder.reset();
        warn!(error = %err, "generation aborted");
        err
    }

    fn finish(&mut self) -> Token {
        self.state = State::Finished;
        Token::end(self.decoder.finish(), self.n_generated)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        info!(n_past = self.n_past, "session released");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("n_ctx", &self.n_ctx)
            .field("n_past", &self.n_past)
            .field("n_generated", &self.n_generated)
            .field("state", &self.state)
            .field("temperature", &self.sampler.temperature())
            .finish_non_exhaustive()
    }
}

/// Iterator over the text of one generation turn, see [`Session::tokens`]
#[derive(Debug)]
pub struct Tokens<'a> {
    session: &'a mut Session,
    done: bool,
}

impl Iterator for Tokens<'_> {
    type Item = Result<String, SessionError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match self.session.next_token() {
                Ok(token) if token.is_end => {
                    self.done = true;
                    if !token.text.is_empty() {
                        return Some(Ok(token.text));
                    }
                }
                Ok(token) if token.text.is_empty() => {}
                Ok(token) => return Some(Ok(token.text)),
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        None
    }
}

fn ensure_readable(kind: &'static str, path: &Path) -> Result<(), SessionError> {
    let not_found = || SessionError::FileNotFound {
        kind,
        path: path.to_path_buf(),
    };
    if path.as_os_str().is_empty() || !path.is_file() {
        return Err(not_found());
    }
    std::fs::File::open(path).map_err(|_| not_found())?;
    Ok(())
}

#[cfg(feature = "llama")]
fn default_engine(params: &SessionParams) -> Result<Box<dyn Engine>, SessionError> {
    let engine = crate::llama::LlamaEngine::load(params).map_err(EngineError::from)?;
    Ok(Box::new(engine))
}

#[cfg(not(feature = "llama"))]
fn default_engine(_params: &SessionParams) -> Result<Box<dyn Engine>, SessionError> {
    Err(SessionError::BackendUnavailable)
}
