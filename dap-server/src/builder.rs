//! The response builder.
//!
//! One builder serves one request: it splits the constraint expression,
//! consults (or populates) the function-result cache, parses the residual
//! constraint against the chosen tree, and streams the requested response
//! shape. Errors raised before the first payload byte become a fresh error
//! envelope; errors mid-payload are injected into the open stream after a
//! blank-line marker, which is the only recovery the protocol offers.

use std::io::{BufRead, BufReader, Write};

use dap_types::request::RequestContext;
use dap_types::response::{EncodingType, ObjectType};
use dap_types::utils::name_path;
use dap_types::{DapError, Dataset};
use log::debug;

use crate::cache::{CacheHandle, FunctionCache};
use crate::ce::{ConstraintEvaluator, split_ce};
use crate::config::ServerConfig;
use crate::ddx::parse_ddx;
use crate::mime::{
    CRLF, cid_to_header_value, generate_cid, get_next_mime_header, is_boundary,
    last_modified_time, read_line, read_multipart_boundary, read_multipart_headers,
    set_mime_binary, set_mime_data_boundary, set_mime_ddx_boundary, set_mime_error,
    set_mime_multipart, set_mime_text,
};
use crate::timeout::TimeoutController;
use crate::xdr::{XdrEncoder, serialize_variable};

/// Identifiers used inside cache entries; fixed so entries are parseable
/// without out-of-band state.
const CACHE_MPM_START: &str = "dataddx_cache_start";
const CACHE_MPM_BOUNDARY: &str = "dataddx_cache_boundary";

/// Builds and streams one response per call.
#[derive(Debug)]
pub struct ResponseBuilder {
    ctx: RequestContext,
    response_limit: u64,
    cache: Option<FunctionCache>,
}

impl ResponseBuilder {
    pub fn new(config: &ServerConfig) -> std::io::Result<Self> {
        let mut ctx = RequestContext::new();
        ctx.set_dataset(&config.dataset);
        ctx.set_timeout_seconds(config.timeout_seconds);
        ctx.set_protocol(&config.default_protocol);

        // A zero budget disables caching; every function CE re-evaluates.
        let cache = if config.cache_max_bytes > 0 {
            Some(FunctionCache::new(
                &config.cache_root,
                &config.cache_prefix,
                config.cache_max_bytes,
            )?)
        } else {
            None
        };

        Ok(Self {
            ctx,
            response_limit: config.response_limit,
            cache,
        })
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut RequestContext {
        &mut self.ctx
    }

    /// Store the constraint expression (WWW escapes undone).
    pub fn set_ce(&mut self, ce: &str) {
        self.ctx.set_ce(ce);
    }

    pub fn ce(&self) -> &str {
        self.ctx.ce()
    }

    fn protocol<'a>(&'a self, dataset: &'a Dataset) -> &'a str {
        if dataset.dap_version.is_empty() {
            self.ctx.protocol()
        } else {
            &dataset.dap_version
        }
    }

    fn record_keywords<E: ConstraintEvaluator + ?Sized>(&mut self, eval: &E) {
        for keyword in eval.keywords() {
            self.ctx.add_keyword(keyword);
        }
    }

    fn check_response_size(&self, dataset: &Dataset) -> Result<(), DapError> {
        if self.response_limit == 0 {
            return Ok(());
        }

        let requested = dataset.request_size(true);
        if requested > self.response_limit {
            return Err(DapError::RequestTooLarge {
                requested_kb: requested / 1024,
                limit_kb: self.response_limit / 1024,
            });
        }

        Ok(())
    }

    // ----- DAS ---------------------------------------------------------------

    /// Send the dataset's attributes.
    pub fn send_das(
        &mut self,
        out: &mut dyn Write,
        dataset: &Dataset,
        with_mime_headers: bool,
    ) -> Result<(), DapError> {
        if with_mime_headers {
            set_mime_text(
                out,
                ObjectType::DodsDas,
                EncodingType::XPlain,
                last_modified_time(self.ctx.dataset()),
                "2.0",
            )?;
        }

        dataset.print_das(out)?;
        out.flush()?;
        Ok(())
    }

    // ----- DDS ---------------------------------------------------------------

    /// Send the dataset's structure, optionally constrained by the CE.
    pub fn send_dds<E>(
        &mut self,
        out: &mut dyn Write,
        dataset: &mut Dataset,
        eval: &mut E,
        constrained: bool,
        with_mime_headers: bool,
    ) -> Result<(), DapError>
    where
        E: ConstraintEvaluator + ?Sized,
    {
        if !constrained {
            if with_mime_headers {
                set_mime_text(
                    out,
                    ObjectType::DodsDds,
                    EncodingType::XPlain,
                    last_modified_time(self.ctx.dataset()),
                    self.protocol(dataset),
                )?;
            }
            dataset.print_dds(out, false)?;
            out.flush()?;
            return Ok(());
        }

        let split = split_ce(eval, self.ctx.ce());

        if !split.function_ce.is_empty() {
            if split.residual_ce.is_empty() {
                return Err(DapError::FunctionalExpression);
            }

            let (mut fdds, handle) = self.function_result(dataset, eval, &split.function_ce)?;

            // Clear the result tree's projections so the residual CE controls
            // what appears.
            fdds.mark_all(false);
            eval.parse_constraint(&split.residual_ce, &mut fdds)?;
            self.record_keywords(eval);

            if with_mime_headers {
                set_mime_text(
                    out,
                    ObjectType::DodsDds,
                    EncodingType::XPlain,
                    last_modified_time(self.ctx.dataset()),
                    self.protocol(dataset),
                )?;
            }
            fdds.print_dds(out, true)?;

            self.release(handle);
        } else {
            eval.parse_constraint(&split.residual_ce, dataset)?;
            self.record_keywords(eval);

            if eval.functional_expression() {
                return Err(DapError::FunctionalExpression);
            }

            if with_mime_headers {
                set_mime_text(
                    out,
                    ObjectType::DodsDds,
                    EncodingType::XPlain,
                    last_modified_time(self.ctx.dataset()),
                    self.protocol(dataset),
                )?;
            }
            dataset.print_dds(out, true)?;
        }

        out.flush()?;
        Ok(())
    }

    // ----- DataDDS ------------------------------------------------------------

    /// Send the binary data response: constrained DDS text, the `Data:` line,
    /// then the XDR stream.
    pub fn send_data<E>(
        &mut self,
        out: &mut dyn Write,
        dataset: &mut Dataset,
        eval: &mut E,
        with_mime_headers: bool,
    ) -> Result<(), DapError>
    where
        E: ConstraintEvaluator + ?Sized,
    {
        let timeout = TimeoutController::establish(self.ctx.timeout_seconds())?;
        let split = split_ce(eval, self.ctx.ce());

        if !split.function_ce.is_empty() {
            debug!("found function(s) in ce: {}", split.function_ce);

            let (mut fdds, handle) = self.function_result(dataset, eval, &split.function_ce)?;

            // Function evaluation may have marked variables; the residual CE
            // alone decides what is sent. An empty residual sends the whole
            // function result.
            fdds.mark_all(false);
            eval.parse_constraint(&split.residual_ce, &mut fdds)?;
            self.record_keywords(eval);

            fdds.tag_nested_sequences();
            self.check_response_size(&fdds)?;

            if with_mime_headers {
                set_mime_binary(
                    out,
                    ObjectType::DodsData,
                    EncodingType::XPlain,
                    last_modified_time(self.ctx.dataset()),
                    self.protocol(dataset),
                )?;
            }

            let result = self.dataset_constraint(out, &fdds, eval, false, &timeout);
            self.release(handle);
            result?;
        } else {
            debug!("simple constraint: {}", split.residual_ce);

            eval.parse_constraint(&split.residual_ce, dataset)?;
            self.record_keywords(eval);

            dataset.tag_nested_sequences();
            self.check_response_size(dataset)?;

            if with_mime_headers {
                set_mime_binary(
                    out,
                    ObjectType::DodsData,
                    EncodingType::XPlain,
                    last_modified_time(self.ctx.dataset()),
                    self.protocol(dataset),
                )?;
            }

            self.dataset_constraint(out, dataset, eval, true, &timeout)?;
        }

        out.flush()?;
        Ok(())
    }

    // ----- DDX ---------------------------------------------------------------

    /// Send the XML structure response. A CE that is nothing but a function
    /// call is rejected; function results only exist in data responses.
    pub fn send_ddx<E>(
        &mut self,
        out: &mut dyn Write,
        dataset: &mut Dataset,
        eval: &mut E,
        with_mime_headers: bool,
    ) -> Result<(), DapError>
    where
        E: ConstraintEvaluator + ?Sized,
    {
        let constrained = !self.ctx.ce().is_empty();

        if constrained {
            let ce = self.ctx.ce().to_owned();
            eval.parse_constraint(&ce, dataset)?;
            self.record_keywords(eval);
        }

        if eval.functional_expression() {
            return Err(DapError::FunctionalExpression);
        }

        if with_mime_headers {
            set_mime_text(
                out,
                ObjectType::Dap4Ddx,
                EncodingType::XPlain,
                last_modified_time(self.ctx.dataset()),
                self.protocol(dataset),
            )?;
        }

        dataset.print_xml(out, constrained, "")?;
        out.flush()?;
        Ok(())
    }

    // ----- DataDDX ------------------------------------------------------------

    /// Send the multipart response: a DDX part referencing a binary part by
    /// Content-Id, then the XDR blob, then the closing boundary.
    pub fn send_data_ddx<E>(
        &mut self,
        out: &mut dyn Write,
        dataset: &mut Dataset,
        eval: &mut E,
        start: &str,
        boundary: &str,
        with_mime_headers: bool,
    ) -> Result<(), DapError>
    where
        E: ConstraintEvaluator + ?Sized,
    {
        let timeout = TimeoutController::establish(self.ctx.timeout_seconds())?;
        let split = split_ce(eval, self.ctx.ce());

        if !split.function_ce.is_empty() {
            let (mut fdds, handle) = self.function_result(dataset, eval, &split.function_ce)?;

            fdds.mark_all(false);
            eval.parse_constraint(&split.residual_ce, &mut fdds)?;
            self.record_keywords(eval);

            fdds.tag_nested_sequences();
            self.check_response_size(&fdds)?;

            if with_mime_headers {
                set_mime_multipart(
                    out,
                    boundary,
                    start,
                    ObjectType::Dap4DataDdx,
                    EncodingType::XPlain,
                    last_modified_time(self.ctx.dataset()),
                    self.protocol(dataset),
                )?;
            }

            let result = self.dataset_constraint_ddx(out, &fdds, eval, boundary, start, false, &timeout);
            self.release(handle);
            result?;
        } else {
            eval.parse_constraint(&split.residual_ce, dataset)?;
            self.record_keywords(eval);

            dataset.tag_nested_sequences();
            self.check_response_size(dataset)?;

            if with_mime_headers {
                set_mime_multipart(
                    out,
                    boundary,
                    start,
                    ObjectType::Dap4DataDdx,
                    EncodingType::XPlain,
                    last_modified_time(self.ctx.dataset()),
                    self.protocol(dataset),
                )?;
            }

            self.dataset_constraint_ddx(out, dataset, eval, boundary, start, true, &timeout)?;
        }

        if with_mime_headers {
            write!(out, "{CRLF}--{boundary}--{CRLF}")?;
        }

        out.flush()?;
        Ok(())
    }

    // ----- Errors -------------------------------------------------------------

    /// Send a fresh error envelope. Only valid before any payload byte has
    /// been written.
    pub fn send_error(&self, out: &mut dyn Write, error: &DapError) -> std::io::Result<()> {
        let (code, reason) = error.status();
        set_mime_error(out, code, reason, self.ctx.protocol())?;
        error.print(out)?;
        out.flush()
    }

    // ----- Internals ----------------------------------------------------------

    fn dataset_constraint<E>(
        &self,
        out: &mut dyn Write,
        dataset: &Dataset,
        eval: &E,
        ce_eval: bool,
        timeout: &TimeoutController,
    ) -> Result<(), DapError>
    where
        E: ConstraintEvaluator + ?Sized,
    {
        dataset.print_dds(out, true)?;
        out.write_all(b"Data:\n")?;

        self.stream_values(out, dataset, eval, ce_eval, timeout)
    }

    fn dataset_constraint_ddx<E>(
        &self,
        out: &mut dyn Write,
        dataset: &Dataset,
        eval: &E,
        boundary: &str,
        start: &str,
        ce_eval: bool,
        timeout: &TimeoutController,
    ) -> Result<(), DapError>
    where
        E: ConstraintEvaluator + ?Sized,
    {
        set_mime_ddx_boundary(out, boundary, start, ObjectType::Dap4Ddx, EncodingType::XPlain)?;

        let cid = generate_cid();
        dataset.print_xml(out, true, &cid)?;

        set_mime_data_boundary(out, boundary, &cid, ObjectType::Dap4Data, EncodingType::Binary)?;

        self.stream_values(out, dataset, eval, ce_eval, timeout)
    }

    /// Stream every projected variable, checking the deadline between
    /// variables. Failures past this point are injected into the stream.
    fn stream_values<E>(
        &self,
        out: &mut dyn Write,
        dataset: &Dataset,
        eval: &E,
        ce_eval: bool,
        timeout: &TimeoutController,
    ) -> Result<(), DapError>
    where
        E: ConstraintEvaluator + ?Sized,
    {
        let mut result = Ok(());

        {
            let mut enc = XdrEncoder::new(&mut *out);
            for var in dataset.vars().iter().filter(|v| v.projected) {
                result = timeout
                    .check()
                    .and_then(|()| serialize_variable(var, eval, &mut enc, ce_eval));
                if result.is_err() {
                    break;
                }
            }
        }

        match result {
            Ok(()) => Ok(()),
            Err(error) => self.inject_stream_error(out, error),
        }
    }

    /// Append `CRLF CRLF` and a serialized error to the open stream. Headers
    /// are long gone; a savvy client scans ahead for the error object.
    fn inject_stream_error(&self, out: &mut dyn Write, error: DapError) -> Result<(), DapError> {
        if matches!(error, DapError::EncoderIo(_)) {
            // The sink itself failed; nothing more can be written.
            return Err(error);
        }

        write!(out, "{CRLF}{CRLF}")?;
        error.print(out)?;
        Err(error)
    }

    /// Obtain the materialized result of the function sub-expression, from
    /// the cache when possible. The returned handle (if any) holds a shared
    /// lock that must outlive streaming.
    fn function_result<E>(
        &self,
        dataset: &mut Dataset,
        eval: &mut E,
        function_ce: &str,
    ) -> Result<(Dataset, Option<CacheHandle>), DapError>
    where
        E: ConstraintEvaluator + ?Sized,
    {
        let Some(cache) = &self.cache else {
            eval.parse_constraint(function_ce, dataset)?;
            return Ok((eval.eval_function_clauses(dataset)?, None));
        };

        let key = FunctionCache::cache_key(self.ctx.dataset(), function_ce);
        let path = cache.file_for_key(&key);

        // A stale or truncated entry is removed up front so the read lock
        // below fails and this process rebuilds it.
        if !cache.is_valid(&path, self.ctx.dataset()) {
            cache.purge_file(&path).map_err(cache_err)?;
        }

        if let Some(handle) = cache.get_read_lock(&path) {
            debug!("function ce cache hit: {}", path.display());
            let fdds = self.read_cached_result(&handle)?;
            return Ok((fdds, Some(handle)));
        }

        if let Some(mut handle) = cache.create_and_lock(&path).map_err(cache_err)? {
            debug!("function ce caching: {}", path.display());

            eval.parse_constraint(function_ce, dataset)?;
            let mut fdds = eval.eval_function_clauses(dataset)?;

            // The 3.2 DDX carries the blob element the cache reader needs.
            fdds.dap_version = "3.2".to_owned();

            if let Err(error) = self.cache_data_ddx(&handle, &mut fdds, eval) {
                cache.purge_file(&path).ok();
                return Err(error);
            }

            cache.exclusive_to_shared_lock(&mut handle).map_err(cache_err)?;

            let total = cache.update_cache_info(&path).map_err(cache_err)?;
            if cache.cache_too_big(total) {
                cache.update_and_purge(&path).map_err(cache_err)?;
            }

            return Ok((fdds, Some(handle)));
        }

        // We lost the creation race; the winner holds (or held) the exclusive
        // lock. One retry as a reader, then give up.
        if let Some(handle) = cache.get_read_lock(&path) {
            debug!("function ce cache hit after retry: {}", path.display());
            let fdds = self.read_cached_result(&handle)?;
            return Ok((fdds, Some(handle)));
        }

        Err(DapError::Cache(
            "could not obtain a lock on the function-result cache entry".to_owned(),
        ))
    }

    fn release(&self, handle: Option<CacheHandle>) {
        if let (Some(cache), Some(handle)) = (&self.cache, handle) {
            cache.unlock_and_close(handle).ok();
        }
    }

    /// Write a function result into its cache entry as a self-contained
    /// DataDDX document.
    fn cache_data_ddx<E>(
        &self,
        handle: &CacheHandle,
        fdds: &mut Dataset,
        eval: &E,
    ) -> Result<(), DapError>
    where
        E: ConstraintEvaluator + ?Sized,
    {
        debug!("caching {}", handle.path().display());

        // The whole result goes into the entry; projections are re-applied by
        // whoever reads it back.
        fdds.mark_all(true);

        let mut sink = handle.file();
        set_mime_multipart(
            &mut sink,
            CACHE_MPM_BOUNDARY,
            CACHE_MPM_START,
            ObjectType::Dap4DataDdx,
            EncodingType::XPlain,
            last_modified_time(self.ctx.dataset()),
            self.protocol(fdds),
        )?;

        let disabled = TimeoutController::establish(0)?;
        self.dataset_constraint_ddx(
            &mut sink,
            fdds,
            eval,
            CACHE_MPM_BOUNDARY,
            CACHE_MPM_START,
            false,
            &disabled,
        )?;

        write!(sink, "{CRLF}--{CACHE_MPM_BOUNDARY}--{CRLF}")?;
        sink.flush()?;
        Ok(())
    }

    fn read_cached_result(&self, handle: &CacheHandle) -> Result<Dataset, DapError> {
        debug!("reading cache entry {}", handle.path().display());

        let mut reader = BufReader::new(handle.file());
        let mut fdds = read_data_from_cache(&mut reader)?;

        fdds.name = format!("function_result_{}", name_path(self.ctx.dataset()));
        fdds.filename = self.ctx.dataset().to_owned();
        Ok(fdds)
    }
}

fn cache_err(error: std::io::Error) -> DapError {
    DapError::Cache(error.to_string())
}

/// Parse a cached DataDDX document: MIME headers, the DDX part, then the XDR
/// blob, in that order. Every variable in the returned tree is materialized
/// and marked read.
pub fn read_data_from_cache<R: BufRead>(input: &mut R) -> Result<Dataset, DapError> {
    // The response headers the entry was written with.
    loop {
        let header = get_next_mime_header(input).map_err(cache_err)?;
        if header.is_empty() {
            break;
        }
    }

    let boundary = read_multipart_boundary(input)?;
    read_multipart_headers(input, "text/xml", ObjectType::Dap4Ddx, None)?;

    // The DDX part runs up to the next boundary line.
    let mut xml = Vec::new();
    loop {
        let Some(line) = read_line(input).map_err(cache_err)? else {
            return Err(DapError::Cache(
                "cache entry ended inside its DDX part".to_owned(),
            ));
        };
        if is_boundary(&line, &boundary) {
            break;
        }
        xml.extend_from_slice(line.as_bytes());
        xml.push(b'\n');
    }

    let (mut fdds, cid) = parse_ddx(&xml)?;
    let cid = cid.ok_or_else(|| {
        DapError::Cache("cached DDX does not reference a data blob".to_owned())
    })?;

    read_multipart_headers(
        input,
        "application/octet-stream",
        ObjectType::Dap4Data,
        Some(&cid_to_header_value(&cid)),
    )?;

    let mut decoder = crate::xdr::XdrDecoder::new(input);
    for var in fdds.vars_mut() {
        decoder
            .deserialize_variable(var)
            .map_err(|e| DapError::Cache(format!("corrupt cache entry: {e}")))?;
    }

    fdds.mark_all_read();
    Ok(fdds)
}
