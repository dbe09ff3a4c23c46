//! S3 XML encoding and decoding.
//!
//! All S3 API responses are XML-encoded.  Renderers build documents with
//! `quick-xml`'s writer, which escapes text content.  Decoders read the
//! small request documents S3 clients send (multipart completion, batch
//! delete, bucket configuration) and reject anything malformed with
//! `MalformedXML`.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;

use crate::cors::CorsRule;
use crate::errors::S3Error;

const S3_NAMESPACE: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

// ── Writer ──────────────────────────────────────────────────────────

/// In-memory XML document under construction.
struct XmlDoc {
    writer: Writer<Cursor<Vec<u8>>>,
}

impl XmlDoc {
    fn new() -> Self {
        let mut doc = Self {
            writer: Writer::new(Cursor::new(Vec::new())),
        };
        doc.emit(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)));
        doc
    }

    fn emit(&mut self, event: Event<'_>) {
        // Writes go to a Vec, which cannot fail.
        self.writer
            .write_event(event)
            .expect("in-memory xml write");
    }

    /// Open the namespaced root element.
    fn root(&mut self, tag: &str) {
        self.emit(Event::Start(
            BytesStart::new(tag).with_attributes([("xmlns", S3_NAMESPACE)]),
        ));
    }

    fn start(&mut self, tag: &str) {
        self.emit(Event::Start(BytesStart::new(tag)));
    }

    fn end(&mut self, tag: &str) {
        self.emit(Event::End(BytesEnd::new(tag)));
    }

    /// `<tag>text</tag>`
    fn text(&mut self, tag: &str, text: &str) {
        self.start(tag);
        self.emit(Event::Text(BytesText::new(text)));
        self.end(tag);
    }

    fn flag(&mut self, tag: &str, value: bool) {
        self.text(tag, if value { "true" } else { "false" });
    }

    /// A parent element containing a flat list of child text elements.
    fn group(&mut self, parent: &str, children: &[(&str, &str)]) {
        self.start(parent);
        for (tag, value) in children {
            self.text(tag, value);
        }
        self.end(parent);
    }

    fn finish(self) -> String {
        String::from_utf8_lossy(&self.writer.into_inner().into_inner()).into_owned()
    }
}

// ── Error response ──────────────────────────────────────────────────

/// Render an S3 `<Error>` XML document.
///
/// ```xml
/// <?xml version="1.0" encoding="UTF-8"?>
/// <Error>
///   <Code>NoSuchBucket</Code>
///   <Message>The specified bucket does not exist</Message>
///   <Resource>/mybucket</Resource>
///   <RequestId>abcd-1234</RequestId>
/// </Error>
/// ```
pub fn render_error(code: &str, message: &str, resource: &str, request_id: &str) -> String {
    let mut doc = XmlDoc::new();
    doc.group(
        "Error",
        &[
            ("Code", code),
            ("Message", message),
            ("Resource", resource),
            ("RequestId", request_id),
        ],
    );
    doc.finish()
}

// ── ListAllMyBucketsResult ──────────────────────────────────────────

/// Render the `<ListAllMyBucketsResult>` response for `GET /`.
///
/// `buckets` is a list of `(name, creation_date)` pairs.
pub fn render_list_buckets_result(
    owner_id: &str,
    owner_display: &str,
    buckets: &[(&str, &str)],
) -> String {
    let mut doc = XmlDoc::new();
    doc.root("ListAllMyBucketsResult");
    doc.group("Owner", &[("ID", owner_id), ("DisplayName", owner_display)]);
    doc.start("Buckets");
    for (name, date) in buckets {
        doc.group("Bucket", &[("Name", name), ("CreationDate", date)]);
    }
    doc.end("Buckets");
    doc.end("ListAllMyBucketsResult");
    doc.finish()
}

// ── ListBucketResult ────────────────────────────────────────────────

/// A single object entry inside a list-objects response.
pub struct ObjectEntry<'a> {
    pub key: &'a str,
    pub last_modified: &'a str,
    pub etag: &'a str,
    pub size: u64,
    pub storage_class: &'a str,
    /// `(ID, DisplayName)`, rendered when present.
    pub owner: Option<(&'a str, &'a str)>,
}

/// Fields shared by both ListObjects flavours.  Keys and prefixes are
/// expected to be URL-encoded already when `encoding_type` is set.
pub struct ListObjectsPage<'a> {
    pub bucket: &'a str,
    pub prefix: &'a str,
    pub delimiter: &'a str,
    pub max_keys: u32,
    pub is_truncated: bool,
    pub encoding_type: Option<&'a str>,
    pub objects: &'a [ObjectEntry<'a>],
    pub common_prefixes: &'a [String],
}

/// Pagination fields that differ between ListObjects V1 and V2.
pub enum ListCursor<'a> {
    V1 {
        marker: &'a str,
        next_marker: Option<&'a str>,
    },
    V2 {
        continuation_token: Option<&'a str>,
        next_continuation_token: Option<&'a str>,
        start_after: Option<&'a str>,
    },
}

/// Render `<ListBucketResult>` for ListObjects V1 or V2.
pub fn render_list_objects_result(page: &ListObjectsPage<'_>, cursor: &ListCursor<'_>) -> String {
    let mut doc = XmlDoc::new();
    doc.root("ListBucketResult");
    doc.text("Name", page.bucket);
    doc.text("Prefix", page.prefix);

    match cursor {
        ListCursor::V1 {
            marker,
            next_marker,
        } => {
            doc.text("Marker", marker);
            if !page.delimiter.is_empty() {
                doc.text("Delimiter", page.delimiter);
            }
            doc.text("MaxKeys", &page.max_keys.to_string());
            doc.flag("IsTruncated", page.is_truncated);
            if let Some(encoding) = page.encoding_type {
                doc.text("EncodingType", encoding);
            }
            if let Some(next) = next_marker {
                doc.text("NextMarker", next);
            }
        }
        ListCursor::V2 {
            continuation_token,
            next_continuation_token,
            start_after,
        } => {
            if !page.delimiter.is_empty() {
                doc.text("Delimiter", page.delimiter);
            }
            doc.text("MaxKeys", &page.max_keys.to_string());
            let key_count = page.objects.len() + page.common_prefixes.len();
            doc.text("KeyCount", &key_count.to_string());
            doc.flag("IsTruncated", page.is_truncated);
            if let Some(encoding) = page.encoding_type {
                doc.text("EncodingType", encoding);
            }
            if let Some(token) = continuation_token {
                doc.text("ContinuationToken", token);
            }
            if let Some(token) = next_continuation_token {
                doc.text("NextContinuationToken", token);
            }
            if let Some(sa) = start_after.filter(|s| !s.is_empty()) {
                doc.text("StartAfter", sa);
            }
        }
    }

    for entry in page.objects {
        doc.start("Contents");
        doc.text("Key", entry.key);
        doc.text("LastModified", entry.last_modified);
        doc.text("ETag", entry.etag);
        doc.text("Size", &entry.size.to_string());
        if let Some((id, display)) = entry.owner {
            doc.group("Owner", &[("ID", id), ("DisplayName", display)]);
        }
        doc.text("StorageClass", entry.storage_class);
        doc.end("Contents");
    }
    for cp in page.common_prefixes {
        doc.group("CommonPrefixes", &[("Prefix", cp)]);
    }

    doc.end("ListBucketResult");
    doc.finish()
}

// ── DeleteResult ────────────────────────────────────────────────────

/// A single deleted object in a DeleteObjects response.
pub struct DeletedEntry<'a> {
    pub key: &'a str,
    pub version_id: Option<&'a str>,
    pub delete_marker: bool,
}

/// A single failure in a DeleteObjects response.
pub struct DeleteErrorEntry<'a> {
    pub key: &'a str,
    pub code: &'a str,
    pub message: &'a str,
}

/// Render `<DeleteResult>` for batch DeleteObjects.  Quiet mode reports
/// failures only.
pub fn render_delete_result(
    deleted: &[DeletedEntry<'_>],
    errors: &[DeleteErrorEntry<'_>],
    quiet: bool,
) -> String {
    let mut doc = XmlDoc::new();
    doc.root("DeleteResult");

    if !quiet {
        for entry in deleted {
            doc.start("Deleted");
            doc.text("Key", entry.key);
            if entry.delete_marker {
                doc.flag("DeleteMarker", true);
                if let Some(v) = entry.version_id {
                    doc.text("DeleteMarkerVersionId", v);
                }
            } else if let Some(v) = entry.version_id {
                doc.text("VersionId", v);
            }
            doc.end("Deleted");
        }
    }

    for entry in errors {
        doc.group(
            "Error",
            &[
                ("Key", entry.key),
                ("Code", entry.code),
                ("Message", entry.message),
            ],
        );
    }

    doc.end("DeleteResult");
    doc.finish()
}

// ── Copy results ────────────────────────────────────────────────────

/// Render `<CopyObjectResult>` returned by `PUT` with `x-amz-copy-source`.
pub fn render_copy_object_result(etag: &str, last_modified: &str) -> String {
    let mut doc = XmlDoc::new();
    doc.group(
        "CopyObjectResult",
        &[("LastModified", last_modified), ("ETag", etag)],
    );
    doc.finish()
}

/// Render `<CopyPartResult>` returned by UploadPartCopy.
pub fn render_copy_part_result(etag: &str, last_modified: &str) -> String {
    let mut doc = XmlDoc::new();
    doc.group(
        "CopyPartResult",
        &[("LastModified", last_modified), ("ETag", etag)],
    );
    doc.finish()
}

// ── Multipart ───────────────────────────────────────────────────────

/// Render `<InitiateMultipartUploadResult>`.
pub fn render_initiate_multipart_upload_result(bucket: &str, key: &str, upload_id: &str) -> String {
    let mut doc = XmlDoc::new();
    doc.root("InitiateMultipartUploadResult");
    doc.text("Bucket", bucket);
    doc.text("Key", key);
    doc.text("UploadId", upload_id);
    doc.end("InitiateMultipartUploadResult");
    doc.finish()
}

/// Render `<CompleteMultipartUploadResult>`.
pub fn render_complete_multipart_upload_result(
    location: &str,
    bucket: &str,
    key: &str,
    etag: &str,
) -> String {
    let mut doc = XmlDoc::new();
    doc.root("CompleteMultipartUploadResult");
    doc.text("Location", location);
    doc.text("Bucket", bucket);
    doc.text("Key", key);
    doc.text("ETag", etag);
    doc.end("CompleteMultipartUploadResult");
    doc.finish()
}

/// A single upload entry in the ListMultipartUploads response.
pub struct UploadEntry<'a> {
    pub key: &'a str,
    pub upload_id: &'a str,
    pub initiated: &'a str,
    pub storage_class: &'a str,
    pub owner_id: &'a str,
    pub owner_display: &'a str,
}

/// Request echo and pagination for ListMultipartUploads.
pub struct UploadsPage<'a> {
    pub bucket: &'a str,
    pub prefix: &'a str,
    pub key_marker: &'a str,
    pub upload_id_marker: &'a str,
    pub next_key_marker: Option<&'a str>,
    pub next_upload_id_marker: Option<&'a str>,
    pub max_uploads: u32,
    pub is_truncated: bool,
}

/// Render `<ListMultipartUploadsResult>` for ListMultipartUploads.
pub fn render_list_multipart_uploads_result(
    page: &UploadsPage<'_>,
    entries: &[UploadEntry<'_>],
) -> String {
    let mut doc = XmlDoc::new();
    doc.root("ListMultipartUploadsResult");
    doc.text("Bucket", page.bucket);
    doc.text("KeyMarker", page.key_marker);
    doc.text("UploadIdMarker", page.upload_id_marker);
    if let Some(nkm) = page.next_key_marker {
        doc.text("NextKeyMarker", nkm);
    }
    if let Some(nuim) = page.next_upload_id_marker {
        doc.text("NextUploadIdMarker", nuim);
    }
    if !page.prefix.is_empty() {
        doc.text("Prefix", page.prefix);
    }
    doc.text("MaxUploads", &page.max_uploads.to_string());
    doc.flag("IsTruncated", page.is_truncated);

    for entry in entries {
        doc.start("Upload");
        doc.text("Key", entry.key);
        doc.text("UploadId", entry.upload_id);
        let owner = [("ID", entry.owner_id), ("DisplayName", entry.owner_display)];
        doc.group("Initiator", &owner);
        doc.group("Owner", &owner);
        doc.text("StorageClass", entry.storage_class);
        doc.text("Initiated", entry.initiated);
        doc.end("Upload");
    }

    doc.end("ListMultipartUploadsResult");
    doc.finish()
}

/// A single part entry in the ListParts response.
pub struct PartEntry<'a> {
    pub part_number: u32,
    pub last_modified: &'a str,
    pub etag: &'a str,
    pub size: u64,
}

/// Request echo and pagination for ListParts.
pub struct PartsPage<'a> {
    pub bucket: &'a str,
    pub key: &'a str,
    pub upload_id: &'a str,
    pub storage_class: &'a str,
    pub owner_id: &'a str,
    pub owner_display: &'a str,
    pub part_number_marker: u32,
    pub next_part_number_marker: Option<u32>,
    pub max_parts: u32,
    pub is_truncated: bool,
}

/// Render `<ListPartsResult>` for ListParts.
pub fn render_list_parts_result(page: &PartsPage<'_>, parts: &[PartEntry<'_>]) -> String {
    let mut doc = XmlDoc::new();
    doc.root("ListPartsResult");
    doc.text("Bucket", page.bucket);
    doc.text("Key", page.key);
    doc.text("UploadId", page.upload_id);
    let owner = [("ID", page.owner_id), ("DisplayName", page.owner_display)];
    doc.group("Initiator", &owner);
    doc.group("Owner", &owner);
    doc.text("StorageClass", page.storage_class);
    doc.text("PartNumberMarker", &page.part_number_marker.to_string());
    if let Some(npm) = page.next_part_number_marker {
        doc.text("NextPartNumberMarker", &npm.to_string());
    }
    doc.text("MaxParts", &page.max_parts.to_string());
    doc.flag("IsTruncated", page.is_truncated);

    for part in parts {
        doc.group(
            "Part",
            &[
                ("PartNumber", &part.part_number.to_string()),
                ("LastModified", part.last_modified),
                ("ETag", part.etag),
                ("Size", &part.size.to_string()),
            ],
        );
    }

    doc.end("ListPartsResult");
    doc.finish()
}

// ── Bucket subresources ─────────────────────────────────────────────

/// Render `<LocationConstraint>` for GetBucketLocation.
///
/// us-east-1 is reported as an empty element, as S3 does.
pub fn render_location_constraint(region: &str) -> String {
    let mut doc = XmlDoc::new();
    let elem = BytesStart::new("LocationConstraint").with_attributes([("xmlns", S3_NAMESPACE)]);
    if region == "us-east-1" || region.is_empty() {
        doc.emit(Event::Empty(elem));
    } else {
        doc.emit(Event::Start(elem));
        doc.emit(Event::Text(BytesText::new(region)));
        doc.end("LocationConstraint");
    }
    doc.finish()
}

/// Render `<VersioningConfiguration>`.  A bucket that never had
/// versioning configured has no `<Status>`.
pub fn render_versioning_configuration(status: Option<&str>) -> String {
    let mut doc = XmlDoc::new();
    doc.root("VersioningConfiguration");
    if let Some(status) = status {
        doc.text("Status", status);
    }
    doc.end("VersioningConfiguration");
    doc.finish()
}

/// Render `<CORSConfiguration>`.
pub fn render_cors_configuration(rules: &[CorsRule]) -> String {
    let mut doc = XmlDoc::new();
    doc.root("CORSConfiguration");
    for rule in rules {
        doc.start("CORSRule");
        if let Some(id) = &rule.id {
            doc.text("ID", id);
        }
        for origin in &rule.allowed_origins {
            doc.text("AllowedOrigin", origin);
        }
        for method in &rule.allowed_methods {
            doc.text("AllowedMethod", method);
        }
        for header in &rule.allowed_headers {
            doc.text("AllowedHeader", header);
        }
        for header in &rule.expose_headers {
            doc.text("ExposeHeader", header);
        }
        if let Some(max_age) = rule.max_age_seconds {
            doc.text("MaxAgeSeconds", &max_age.to_string());
        }
        doc.end("CORSRule");
    }
    doc.end("CORSConfiguration");
    doc.finish()
}

// ── Decoders ────────────────────────────────────────────────────────

/// Walk a request document, calling `visit` with the element path for
/// the text of each leaf element (`Some(text)`, exactly as sent) and for
/// each closing element (`None`).  CDATA sections count as text.
fn walk<F>(body: &[u8], mut visit: F) -> Result<(), S3Error>
where
    F: FnMut(&[&str], Option<String>) -> Result<(), S3Error>,
{
    let mut reader = Reader::from_reader(body);

    let mut stack: Vec<String> = Vec::new();
    let mut text = String::new();
    let mut leaf = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                stack.push(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
                text.clear();
                leaf = true;
            }
            Ok(Event::Empty(ref e)) => {
                stack.push(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
                let path: Vec<&str> = stack.iter().map(String::as_str).collect();
                visit(&path, None)?;
                stack.pop();
                leaf = false;
            }
            Ok(Event::Text(ref e)) => {
                text.push_str(&e.unescape().map_err(|_| S3Error::MalformedXML)?);
            }
            Ok(Event::CData(e)) => {
                let raw = e.into_inner();
                text.push_str(std::str::from_utf8(&raw).map_err(|_| S3Error::MalformedXML)?);
            }
            Ok(Event::End(_)) => {
                let path: Vec<&str> = stack.iter().map(String::as_str).collect();
                if leaf && !text.is_empty() {
                    visit(&path, Some(std::mem::take(&mut text)))?;
                }
                text.clear();
                leaf = false;
                visit(&path, None)?;
                stack.pop();
            }
            Ok(Event::Eof) => break,
            Err(_) => return Err(S3Error::MalformedXML),
            _ => {}
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(S3Error::MalformedXML);
    }
    Ok(())
}

fn is_blank(body: &[u8]) -> bool {
    body.iter().all(u8::is_ascii_whitespace)
}

/// Parse a `<CompleteMultipartUpload>` body into `(part_number, etag)`
/// pairs in document order.
pub fn parse_complete_multipart_upload(body: &[u8]) -> Result<Vec<(u32, String)>, S3Error> {
    let mut parts = Vec::new();
    let mut part_number: Option<u32> = None;
    let mut etag: Option<String> = None;

    walk(body, |path, text| {
        match (path, text) {
            (["CompleteMultipartUpload", "Part", "PartNumber"], Some(t)) => {
                part_number = Some(t.trim().parse().map_err(|_| S3Error::MalformedXML)?);
            }
            (["CompleteMultipartUpload", "Part", "ETag"], Some(t)) => {
                etag = Some(t.trim().to_string())
            }
            (["CompleteMultipartUpload", "Part"], None) => {
                match (part_number.take(), etag.take()) {
                    (Some(n), Some(e)) => parts.push((n, e)),
                    _ => return Err(S3Error::MalformedXML),
                }
            }
            _ => {}
        }
        Ok(())
    })?;

    if parts.is_empty() {
        return Err(S3Error::MalformedXML);
    }
    Ok(parts)
}

/// One object named in a batch delete request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteTarget {
    pub key: String,
    pub version_id: Option<String>,
}

/// Parsed `<Delete>` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRequest {
    pub objects: Vec<DeleteTarget>,
    pub quiet: bool,
}

/// Parse a batch delete `<Delete>` body.
pub fn parse_delete(body: &[u8]) -> Result<DeleteRequest, S3Error> {
    let mut objects = Vec::new();
    let mut quiet = false;
    let mut key: Option<String> = None;
    let mut version_id: Option<String> = None;

    walk(body, |path, text| {
        match (path, text) {
            (["Delete", "Quiet"], Some(t)) => quiet = t.trim().eq_ignore_ascii_case("true"),
            (["Delete", "Object", "Key"], Some(t)) => key = Some(t),
            (["Delete", "Object", "VersionId"], Some(t)) => {
                version_id = Some(t.trim().to_string())
            }
            (["Delete", "Object"], None) => match key.take() {
                Some(k) => objects.push(DeleteTarget {
                    key: k,
                    version_id: version_id.take(),
                }),
                None => return Err(S3Error::MalformedXML),
            },
            _ => {}
        }
        Ok(())
    })?;

    if objects.is_empty() {
        return Err(S3Error::MalformedXML);
    }
    Ok(DeleteRequest { objects, quiet })
}

/// Parse an optional `<CreateBucketConfiguration>` body.  An empty body
/// means the default region.
pub fn parse_location_constraint(body: &[u8]) -> Result<Option<String>, S3Error> {
    if is_blank(body) {
        return Ok(None);
    }
    let mut location = None;
    walk(body, |path, text| {
        if let (["CreateBucketConfiguration", "LocationConstraint"], Some(t)) = (path, text) {
            location = Some(t.trim().to_string()).filter(|l| !l.is_empty());
        }
        Ok(())
    })?;
    Ok(location)
}

/// Parse a `<VersioningConfiguration>` body, returning its status.
pub fn parse_versioning_configuration(body: &[u8]) -> Result<String, S3Error> {
    let mut status = None;
    walk(body, |path, text| {
        if let (["VersioningConfiguration", "Status"], Some(t)) = (path, text) {
            status = Some(t.trim().to_string());
        }
        Ok(())
    })?;
    match status {
        Some(s) if s == "Enabled" || s == "Suspended" => Ok(s),
        _ => Err(S3Error::MalformedXML),
    }
}

/// Parse a `<CORSConfiguration>` body into its rules.
pub fn parse_cors_configuration(body: &[u8]) -> Result<Vec<CorsRule>, S3Error> {
    let mut rules = Vec::new();
    let mut current = CorsRule::default();

    walk(body, |path, text| {
        let Some(rest) = path.strip_prefix(&["CORSConfiguration", "CORSRule"]) else {
            return Ok(());
        };
        match (rest, text) {
            (["ID"], Some(t)) => current.id = Some(t.trim().to_string()),
            (["AllowedOrigin"], Some(t)) => current.allowed_origins.push(t.trim().to_string()),
            (["AllowedMethod"], Some(t)) => current.allowed_methods.push(t.trim().to_string()),
            (["AllowedHeader"], Some(t)) => current.allowed_headers.push(t.trim().to_string()),
            (["ExposeHeader"], Some(t)) => current.expose_headers.push(t.trim().to_string()),
            (["MaxAgeSeconds"], Some(t)) => {
                current.max_age_seconds =
                    Some(t.trim().parse().map_err(|_| S3Error::MalformedXML)?);
            }
            ([], None) => rules.push(std::mem::take(&mut current)),
            _ => {}
        }
        Ok(())
    })?;

    if rules.is_empty() {
        return Err(S3Error::MalformedXML);
    }
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_escapes_text() {
        let xml = render_error("InvalidArgument", "a < b & \"c\"", "/b/k", "req-1");
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<Message>a &lt; b &amp; &quot;c&quot;</Message>"));
        assert!(xml.contains("<RequestId>req-1</RequestId>"));
    }

    #[test]
    fn test_list_v2_counts_keys_and_prefixes() {
        let objects = [ObjectEntry {
            key: "b.txt",
            last_modified: "2026-01-01T00:00:00.000Z",
            etag: "\"abc\"",
            size: 3,
            storage_class: "STANDARD",
            owner: None,
        }];
        let prefixes = vec!["a/".to_string()];
        let page = ListObjectsPage {
            bucket: "bkt",
            prefix: "",
            delimiter: "/",
            max_keys: 1000,
            is_truncated: false,
            encoding_type: None,
            objects: &objects,
            common_prefixes: &prefixes,
        };
        let xml = render_list_objects_result(
            &page,
            &ListCursor::V2 {
                continuation_token: None,
                next_continuation_token: None,
                start_after: None,
            },
        );
        assert!(xml.contains("<KeyCount>2</KeyCount>"));
        assert!(xml.contains("<Delimiter>/</Delimiter>"));
        assert!(xml.contains("<CommonPrefixes><Prefix>a/</Prefix></CommonPrefixes>"));
        assert!(xml.contains("<ETag>&quot;abc&quot;</ETag>"));
        assert!(!xml.contains("<Marker>"));
    }

    #[test]
    fn test_list_v1_has_marker() {
        let page = ListObjectsPage {
            bucket: "bkt",
            prefix: "p/",
            delimiter: "",
            max_keys: 2,
            is_truncated: true,
            encoding_type: Some("url"),
            objects: &[],
            common_prefixes: &[],
        };
        let xml = render_list_objects_result(
            &page,
            &ListCursor::V1 {
                marker: "m",
                next_marker: Some("n"),
            },
        );
        assert!(xml.contains("<Marker>m</Marker>"));
        assert!(xml.contains("<NextMarker>n</NextMarker>"));
        assert!(xml.contains("<EncodingType>url</EncodingType>"));
        assert!(xml.contains("<IsTruncated>true</IsTruncated>"));
    }

    #[test]
    fn test_delete_result_quiet_reports_errors_only() {
        let deleted = [DeletedEntry {
            key: "a",
            version_id: None,
            delete_marker: false,
        }];
        let errors = [DeleteErrorEntry {
            key: "b",
            code: "AccessDenied",
            message: "Access Denied",
        }];
        let xml = render_delete_result(&deleted, &errors, true);
        assert!(!xml.contains("<Deleted>"));
        assert!(xml.contains("<Code>AccessDenied</Code>"));

        let xml = render_delete_result(&deleted, &[], false);
        assert!(xml.contains("<Deleted><Key>a</Key></Deleted>"));
    }

    #[test]
    fn test_location_constraint_default_region_is_empty() {
        assert!(render_location_constraint("us-east-1").contains("<LocationConstraint xmlns="));
        assert!(render_location_constraint("us-east-1").contains("/>"));
        assert!(render_location_constraint("eu-west-1").contains(">eu-west-1</LocationConstraint>"));
    }

    #[test]
    fn test_parse_complete_multipart_upload() {
        let body = br#"<CompleteMultipartUpload xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
            <Part><PartNumber>1</PartNumber><ETag>"aaa"</ETag></Part>
            <Part><ETag>&quot;bbb&quot;</ETag><PartNumber>2</PartNumber></Part>
        </CompleteMultipartUpload>"#;
        let parts = parse_complete_multipart_upload(body).unwrap();
        assert_eq!(
            parts,
            vec![(1, "\"aaa\"".to_string()), (2, "\"bbb\"".to_string())]
        );
    }

    #[test]
    fn test_parse_complete_rejects_incomplete_part() {
        let body = b"<CompleteMultipartUpload><Part><PartNumber>1</PartNumber></Part></CompleteMultipartUpload>";
        assert!(matches!(
            parse_complete_multipart_upload(body),
            Err(S3Error::MalformedXML)
        ));
        assert!(matches!(
            parse_complete_multipart_upload(b"<CompleteMultipartUpload>"),
            Err(S3Error::MalformedXML)
        ));
        assert!(matches!(
            parse_complete_multipart_upload(b"not xml at all"),
            Err(S3Error::MalformedXML)
        ));
    }

    #[test]
    fn test_parse_delete() {
        let body = b"<Delete><Quiet>true</Quiet>\
            <Object><Key>a.txt</Key></Object>\
            <Object><Key>b.txt</Key><VersionId>v1</VersionId></Object></Delete>";
        let req = parse_delete(body).unwrap();
        assert!(req.quiet);
        assert_eq!(req.objects.len(), 2);
        assert_eq!(req.objects[1].version_id.as_deref(), Some("v1"));
        assert!(req.objects[0].version_id.is_none());
    }

    #[test]
    fn test_parse_delete_keeps_key_text_verbatim() {
        let body = b"<Delete>\n  <Object>\n    <Key> padded key </Key>\n  </Object>\n\
            <Object><Key><![CDATA[a<b&c]]></Key></Object>\
            <Object><Key>x<![CDATA[ & ]]>y</Key><VersionId> v2 </VersionId></Object>\n</Delete>";
        let req = parse_delete(body).unwrap();
        let keys: Vec<&str> = req.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec![" padded key ", "a<b&c", "x & y"]);
        assert_eq!(req.objects[2].version_id.as_deref(), Some("v2"));
        assert!(!req.quiet);
    }

    #[test]
    fn test_parse_location_constraint() {
        assert_eq!(parse_location_constraint(b"").unwrap(), None);
        let body = b"<CreateBucketConfiguration><LocationConstraint>eu-west-1</LocationConstraint></CreateBucketConfiguration>";
        assert_eq!(
            parse_location_constraint(body).unwrap().as_deref(),
            Some("eu-west-1")
        );
    }

    #[test]
    fn test_parse_versioning_configuration() {
        let body = b"<VersioningConfiguration><Status>Suspended</Status></VersioningConfiguration>";
        assert_eq!(parse_versioning_configuration(body).unwrap(), "Suspended");
        let bad = b"<VersioningConfiguration><Status>Maybe</Status></VersioningConfiguration>";
        assert!(parse_versioning_configuration(bad).is_err());
    }

    #[test]
    fn test_cors_configuration_survives_render_and_parse() {
        let body = b"<CORSConfiguration><CORSRule><ID>web</ID>\
            <AllowedOrigin>https://example.com</AllowedOrigin>\
            <AllowedMethod>GET</AllowedMethod><AllowedMethod>PUT</AllowedMethod>\
            <AllowedHeader>*</AllowedHeader><ExposeHeader>ETag</ExposeHeader>\
            <MaxAgeSeconds>600</MaxAgeSeconds></CORSRule></CORSConfiguration>";
        let rules = parse_cors_configuration(body).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].allowed_methods, vec!["GET", "PUT"]);
        assert_eq!(rules[0].max_age_seconds, Some(600));

        let rendered = render_cors_configuration(&rules);
        assert_eq!(parse_cors_configuration(rendered.as_bytes()).unwrap(), rules);
    }
}
