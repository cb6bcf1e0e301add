//! Manifest sources.
//!
//! A location is either an `https://` URL or a path inside a read-only bundle
//! of manifests shipped with the tests. Plaintext `http://` is refused before
//! any request is made.

use std::{
	borrow::Cow,
	collections::HashMap,
	error::Error as StdError,
	fmt, fs, io,
	path::{Component, Path, PathBuf},
	sync::Arc,
	time::Duration,
};

use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum FetchError {
	#[error("unsupported transport for {location}: plaintext http is not allowed")]
	UnsupportedTransport { location: String },

	#[error("incomplete transfer from {location}: expected {expected} bytes, received {received}")]
	IncompleteTransfer {
		location: String,
		expected: u64,
		received: u64,
	},

	#[error("fetching {location}")]
	FetchFailed {
		location: String,
		#[source]
		source: Box<dyn StdError + Send + Sync>,
	},

	#[error("manifest {location} not found in bundle")]
	NotFound { location: String },
}

/// Classified manifest location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestLocation<'a> {
	/// Path inside the manifest bundle.
	Bundle(&'a str),
	/// Remote HTTPS URL.
	Https(&'a str),
}

impl<'a> ManifestLocation<'a> {
	pub fn parse(location: &'a str) -> Result<Self, FetchError> {
		if location.starts_with("http://") {
			return Err(FetchError::UnsupportedTransport {
				location: location.to_string(),
			});
		}
		if location.starts_with("https://") {
			return Ok(Self::Https(location));
		}
		Ok(Self::Bundle(location))
	}
}

/// Bytes of a manifest together with where they came from.
#[derive(Clone, PartialEq, Eq)]
pub struct RawManifest {
	location: String,
	bytes: Vec<u8>,
}

impl RawManifest {
	pub fn new(location: impl Into<String>, bytes: Vec<u8>) -> Self {
		Self {
			location: location.into(),
			bytes,
		}
	}

	pub fn location(&self) -> &str {
		&self.location
	}

	pub fn bytes(&self) -> &[u8] {
		&self.bytes
	}

	/// Manifest text for diagnostics. Invalid UTF-8 is replaced.
	pub fn text(&self) -> Cow<'_, str> {
		String::from_utf8_lossy(&self.bytes)
	}
}

impl fmt::Debug for RawManifest {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RawManifest")
			.field("location", &self.location)
			.field("len", &self.bytes.len())
			.finish()
	}
}

/// Read-only collection of manifests addressed by relative path.
pub trait ManifestBundle: Send + Sync {
	/// Read a manifest. A missing entry is reported as [`io::ErrorKind::NotFound`].
	fn read(&self, path: &str) -> io::Result<Cow<'_, [u8]>>;
}

/// Bundle backed by a directory on disk.
#[derive(Debug, Clone)]
pub struct DirBundle {
	root: PathBuf,
}

impl DirBundle {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}
}

impl ManifestBundle for DirBundle {
	fn read(&self, path: &str) -> io::Result<Cow<'_, [u8]>> {
		let relative = Path::new(path);
		// Entries never escape the bundle root.
		if !relative
			.components()
			.all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
		{
			return Err(io::Error::new(
				io::ErrorKind::NotFound,
				format!("{path} is outside the bundle"),
			));
		}
		fs::read(self.root.join(relative)).map(Cow::Owned)
	}
}

/// Bundle held in memory, mostly for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticBundle {
	files: HashMap<String, Vec<u8>>,
}

impl StaticBundle {
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn with_file(mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
		self.files.insert(path.into(), contents.into());
		self
	}
}

impl ManifestBundle for StaticBundle {
	fn read(&self, path: &str) -> io::Result<Cow<'_, [u8]>> {
		self.files
			.get(path)
			.map(|bytes| Cow::Borrowed(bytes.as_slice()))
			.ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
	}
}

/// Resolves manifest locations into bytes.
#[derive(Clone)]
pub struct ManifestFetcher {
	http: reqwest::Client,
	bundle: Arc<dyn ManifestBundle>,
	fetch_timeout: Duration,
}

impl fmt::Debug for ManifestFetcher {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ManifestFetcher")
			.field("fetch_timeout", &self.fetch_timeout)
			.finish_non_exhaustive()
	}
}

impl ManifestFetcher {
	pub fn new(bundle: Arc<dyn ManifestBundle>, fetch_timeout: Duration) -> Self {
		Self::with_client(reqwest::Client::new(), bundle, fetch_timeout)
	}

	pub fn with_client(
		http: reqwest::Client,
		bundle: Arc<dyn ManifestBundle>,
		fetch_timeout: Duration,
	) -> Self {
		Self {
			http,
			bundle,
			fetch_timeout,
		}
	}

	#[instrument(skip(self))]
	pub async fn fetch(&self, location: &str) -> Result<RawManifest, FetchError> {
		match ManifestLocation::parse(location)? {
			ManifestLocation::Https(url) => self.fetch_remote(url).await,
			ManifestLocation::Bundle(path) => self.read_bundle(path),
		}
	}

	fn read_bundle(&self, path: &str) -> Result<RawManifest, FetchError> {
		match self.bundle.read(path) {
			Ok(bytes) => {
				tracing::debug!(path, len = bytes.len(), "read manifest from bundle");
				Ok(RawManifest::new(path, bytes.into_owned()))
			}
			Err(e) if e.kind() == io::ErrorKind::NotFound => Err(FetchError::NotFound {
				location: path.to_string(),
			}),
			Err(e) => Err(FetchError::FetchFailed {
				location: path.to_string(),
				source: Box::new(e),
			}),
		}
	}

	/// One GET, body included, bounded by the fetch timeout.
	///
	/// Does not check the URL scheme; [`Self::fetch`] does that.
	pub(crate) async fn fetch_remote(&self, url: &str) -> Result<RawManifest, FetchError> {
		let failed = |source: Box<dyn StdError + Send + Sync>| FetchError::FetchFailed {
			location: url.to_string(),
			source,
		};

		let request = async {
			let mut response = self.http.get(url).send().await?.error_for_status()?;
			let declared = response.content_length();
			let mut body = Vec::new();
			let interrupted = loop {
				match response.chunk().await {
					Ok(Some(chunk)) => body.extend_from_slice(&chunk),
					Ok(None) => break None,
					Err(e) => break Some(e),
				}
			};
			Ok::<_, reqwest::Error>((declared, body, interrupted))
		};

		let (declared, body, interrupted) = tokio::time::timeout(self.fetch_timeout, request)
			.await
			.map_err(|elapsed| failed(Box::new(elapsed)))?
			.map_err(|e| failed(Box::new(e)))?;

		let received = body.len() as u64;
		if let Some(err) = interrupted {
			// A body cut short of its Content-Length surfaces as a body error.
			return match declared {
				Some(expected) if received < expected => Err(FetchError::IncompleteTransfer {
					location: url.to_string(),
					expected,
					received,
				}),
				_ => Err(failed(Box::new(err))),
			};
		}

		verify_transfer(url, declared, received)?;
		tracing::debug!(url, len = received, "fetched remote manifest");
		Ok(RawManifest::new(url, body))
	}
}

/// Compare the declared Content-Length with what was actually read.
pub(crate) fn verify_transfer(
	location: &str,
	declared: Option<u64>,
	received: u64,
) -> Result<(), FetchError> {
	match declared {
		Some(expected) if expected != received => Err(FetchError::IncompleteTransfer {
			location: location.to_string(),
			expected,
			received,
		}),
		_ => Ok(()),
	}
}
