//! Status line + headers + a memory-mapped file, built directly into the
//! connection's write buffer so the body never gets copied into user space:
//! the mapped region becomes the second scatter-write segment.

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::buffer::ByteBuffer;

const WORLD_READABLE: u32 = 0o004;

fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        302 => "Found",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        _ => "Internal Server Error",
    }
}

fn mime_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html",
        Some("xml") => "text/xml",
        Some("xhtml") => "application/xhtml+xml",
        Some("txt") => "text/plain",
        Some("rtf") => "application/rtf",
        Some("pdf") => "application/pdf",
        Some("word") | Some("doc") => "application/msword",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("au") => "audio/basic",
        Some("mpeg") | Some("mpg") => "video/mpeg",
        Some("avi") => "video/x-msvideo",
        Some("gz") => "application/x-gzip",
        Some("tar") => "application/x-tar",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        _ => "text/plain",
    }
}

/// Owns the memory-mapped file (if any) backing the second scatter-write
/// segment. Replacing or dropping unmaps it; there is never more than one
/// live mapping at a time.
pub struct HttpResponse {
    status_code: u16,
    mmap: Option<Mmap>,
}

impl HttpResponse {
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// The file body as a byte slice, or empty once fully drained or when
    /// no file is mapped (error bodies are written straight into the write
    /// buffer instead).
    pub fn file_segment(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }
}

/// Resolves `root + path` against `error_pages`, stats and mmaps the
/// resulting file, and writes the status line/headers into `write_buf`.
/// `pre_assigned` lets the caller force a status (e.g. 400 on a parse
/// failure) while still resolving the matching canned error page.
pub fn make_response(
    write_buf: &mut ByteBuffer,
    root: &str,
    req_path: &str,
    keep_alive: bool,
    error_pages: &HashMap<u16, String>,
    pre_assigned: Option<u16>,
) -> HttpResponse {
    let mut path = req_path.to_string();
    let mut status = pre_assigned.unwrap_or(0);

    let resolve = |root: &str, path: &str| -> PathBuf { Path::new(root).join(path.trim_start_matches('/')) };

    let mut full_path = resolve(root, &path);
    if status == 0 {
        status = match std::fs::metadata(&full_path) {
            Ok(meta) if meta.is_dir() => 404,
            Ok(meta) if meta.permissions().mode() & WORLD_READABLE == 0 => 403,
            Ok(_) => 200,
            Err(_) => 404,
        };
    }

    if status != 200 {
        if let Some(err_path) = error_pages.get(&status) {
            path = err_path.clone();
            full_path = resolve(root, &path);
        }
    }

    let mmap = open_and_map(&full_path);

    let reason = status_text(status);
    write_buf.append(format!("HTTP/1.1 {status} {reason}\r\n").as_bytes());
    if keep_alive {
        write_buf.append(b"Connection: keep-alive\r\nkeep-alive: max=6, timeout=120\r\n");
    } else {
        write_buf.append(b"Connection: close\r\n");
    }
    write_buf.append(format!("Content-type: {}\r\n", mime_for(&full_path)).as_bytes());

    match mmap {
        Some(mmap) => {
            write_buf.append(format!("Content-length: {}\r\n\r\n", mmap.len()).as_bytes());
            HttpResponse {
                status_code: status,
                mmap: Some(mmap),
            }
        }
        None => {
            let body = format!(
                "<html><head><title>{status} {reason}</title></head>\
                 <body><h1>{status} {reason}</h1></body></html>"
            );
            write_buf.append(format!("Content-length: {}\r\n\r\n", body.len()).as_bytes());
            write_buf.append(body.as_bytes());
            HttpResponse {
                status_code: status,
                mmap: None,
            }
        }
    }
}

fn open_and_map(path: &Path) -> Option<Mmap> {
    let file = File::open(path).ok()?;
    // SAFETY: the resource root is a read-only static asset directory for
    // the lifetime of the process; concurrent truncation is out of scope.
    unsafe { Mmap::map(&file).ok() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn existing_file_maps_and_reports_200() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "index.html", b"<h1>hi</h1>");
        let mut write_buf = ByteBuffer::new();
        let resp = make_response(
            &mut write_buf,
            dir.path().to_str().unwrap(),
            "/index.html",
            true,
            &HashMap::new(),
            None,
        );
        assert_eq!(resp.status_code(), 200);
        assert_eq!(resp.file_segment(), b"<h1>hi</h1>");
        let headers = String::from_utf8_lossy(write_buf.peek()).into_owned();
        assert!(headers.contains("200 OK"));
        assert!(headers.contains("Content-type: text/html"));
        assert!(headers.contains("Content-length: 11"));
    }

    #[test]
    fn missing_file_without_error_page_synthesizes_body() {
        let dir = tempfile::tempdir().unwrap();
        let mut write_buf = ByteBuffer::new();
        let resp = make_response(
            &mut write_buf,
            dir.path().to_str().unwrap(),
            "/nope.html",
            true,
            &HashMap::new(),
            None,
        );
        assert_eq!(resp.status_code(), 404);
        assert!(resp.file_segment().is_empty());
        let body = String::from_utf8_lossy(write_buf.peek()).into_owned();
        assert!(body.contains("404 Not Found"));
    }

    #[test]
    fn missing_file_with_canned_error_page_maps_it() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "404.html", b"not here");
        let mut write_buf = ByteBuffer::new();
        let mut pages = HashMap::new();
        pages.insert(404, "/404.html".to_string());
        let resp = make_response(
            &mut write_buf,
            dir.path().to_str().unwrap(),
            "/nope.html",
            true,
            &pages,
            None,
        );
        assert_eq!(resp.status_code(), 404);
        assert_eq!(resp.file_segment(), b"not here");
    }

    #[test]
    fn directory_target_reports_404() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let mut write_buf = ByteBuffer::new();
        let resp = make_response(
            &mut write_buf,
            dir.path().to_str().unwrap(),
            "/sub",
            true,
            &HashMap::new(),
            None,
        );
        assert_eq!(resp.status_code(), 404);
    }
}
