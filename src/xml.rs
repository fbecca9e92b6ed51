//! Streaming XML decoding.
//!
//! A thin convenience layer over quick-xml tailored to the RRDP
//! documents: elements with attributes, optional base64 text content, no
//! mixed content. Names are matched on their local part only; the RRDP
//! namespace carries no distinguishing information for us.

use std::{fmt, io, str};
use std::str::FromStr;
use quick_xml::events::{BytesStart, Event};


//------------ Reader --------------------------------------------------------

/// An XML reader.
///
/// This struct holds all state necessary for parsing an XML document.
pub struct Reader<R: io::BufRead> {
    reader: quick_xml::Reader<R>,
    buf: Vec<u8>,
}

impl<R: io::BufRead> Reader<R> {
    /// Creates a new reader from an underlying reader.
    pub fn new(reader: R) -> Self {
        let mut reader = quick_xml::Reader::from_reader(reader);
        reader.trim_text(true);
        Reader { reader, buf: Vec::new() }
    }

    /// Parses the start of the document.
    ///
    /// Skips over XML declarations, comments and doctypes until the root
    /// element begins.
    pub fn start<F, E>(&mut self, op: F) -> Result<Content, E>
    where F: FnOnce(Element) -> Result<(), E>, E: From<Error> {
        loop {
            self.buf.clear();
            let event = self.reader.read_event(&mut self.buf)
                .map_err(|err| E::from(err.into()))?;
            match event {
                Event::Start(start) => {
                    op(Element::new(start))?;
                    return Ok(Content { empty: false })
                }
                Event::Empty(start) => {
                    op(Element::new(start))?;
                    return Ok(Content { empty: true })
                }
                Event::Comment(_) | Event::Decl(_) | Event::DocType(_) => { }
                _ => return Err(Error::Malformed.into())
            }
        }
    }

    /// Parses the end of the document.
    pub fn end(&mut self) -> Result<(), Error> {
        loop {
            self.buf.clear();
            match self.reader.read_event(&mut self.buf)? {
                Event::Eof => return Ok(()),
                Event::Comment(_) => { }
                _ => return Err(Error::Malformed)
            }
        }
    }
}


//------------ Element -------------------------------------------------------

/// The start of an element.
pub struct Element<'b> {
    start: BytesStart<'b>,
}

impl<'b> Element<'b> {
    fn new(start: BytesStart<'b>) -> Self {
        Element { start }
    }

    /// Returns the local name of the element.
    pub fn name(&self) -> &[u8] {
        self.start.local_name()
    }

    /// Processes the attributes of the element.
    ///
    /// Namespace declarations are skipped; everything else is handed to
    /// `op` with its local name.
    pub fn attributes<F, E>(&self, mut op: F) -> Result<(), E>
    where
        F: FnMut(&[u8], AttrValue) -> Result<(), E>,
        E: From<Error>
    {
        for attr in self.start.attributes() {
            let attr = attr.map_err(|_| E::from(Error::Malformed))?;
            if attr.key == b"xmlns" || attr.key.starts_with(b"xmlns:") {
                continue
            }
            op(attr.key, AttrValue(attr))?;
        }
        Ok(())
    }
}


//------------ Content -------------------------------------------------------

/// The content of an element currently being read.
pub struct Content {
    empty: bool,
}

impl Content {
    pub fn is_empty(&self) -> bool {
        self.empty
    }

    /// Takes the next child element, if there is one.
    ///
    /// Returns `None` when the enclosing element ends instead.
    pub fn take_opt_element<R, F, E>(
        &mut self,
        reader: &mut Reader<R>,
        op: F
    ) -> Result<Option<Content>, E>
    where
        R: io::BufRead,
        F: FnOnce(Element) -> Result<(), E>,
        E: From<Error>
    {
        if self.empty {
            return Ok(None)
        }
        loop {
            reader.buf.clear();
            let event = reader.reader.read_event(&mut reader.buf)
                .map_err(|err| E::from(err.into()))?;
            match event {
                Event::Start(start) => {
                    op(Element::new(start))?;
                    return Ok(Some(Content { empty: false }))
                }
                Event::Empty(start) => {
                    op(Element::new(start))?;
                    return Ok(Some(Content { empty: true }))
                }
                Event::End(_) => {
                    self.empty = true;
                    return Ok(None)
                }
                Event::Comment(_) => { }
                _ => return Err(Error::Malformed.into())
            }
        }
    }

    /// Takes the text content and the end of the element.
    ///
    /// Returns the empty string for an element without content.
    pub fn take_final_text<R, F, T>(
        &mut self,
        reader: &mut Reader<R>,
        op: F
    ) -> Result<T, Error>
    where
        R: io::BufRead,
        F: FnOnce(Text) -> Result<T, Error>,
    {
        if self.empty {
            return op(Text(Vec::new()))
        }
        loop {
            reader.buf.clear();
            let event = reader.reader.read_event(&mut reader.buf)?;
            match event {
                Event::Text(text) => {
                    let res = op(Text(text.unescaped()?.into_owned()))?;
                    self.take_end(reader)?;
                    return Ok(res)
                }
                Event::End(_) => {
                    self.empty = true;
                    return op(Text(Vec::new()))
                }
                Event::Comment(_) => { }
                _ => return Err(Error::Malformed)
            }
        }
    }

    /// Takes the end of the element.
    pub fn take_end<R: io::BufRead>(
        &mut self,
        reader: &mut Reader<R>
    ) -> Result<(), Error> {
        if self.empty {
            return Ok(())
        }
        loop {
            reader.buf.clear();
            match reader.reader.read_event(&mut reader.buf)? {
                Event::End(_) => {
                    self.empty = true;
                    return Ok(())
                }
                Event::Comment(_) => { }
                _ => return Err(Error::Malformed)
            }
        }
    }
}


//------------ AttrValue -----------------------------------------------------

/// The value of an attribute.
pub struct AttrValue<'a>(quick_xml::events::attributes::Attribute<'a>);

impl<'a> AttrValue<'a> {
    /// Converts the value by parsing its ASCII representation.
    pub fn ascii_into<T: FromStr>(self) -> Result<T, Error> {
        let s = self.0.unescaped_value()?;
        if !s.is_ascii() {
            return Err(Error::Malformed)
        }
        let s = unsafe { str::from_utf8_unchecked(s.as_ref()) };
        T::from_str(s).map_err(|_| Error::Malformed)
    }
}


//------------ Text ----------------------------------------------------------

/// The text content of an element.
pub struct Text(Vec<u8>);

impl Text {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Decodes the text as xsd:base64Binary.
    ///
    /// Whitespace anywhere in the text is allowed and ignored.
    pub fn base64_decode(&self) -> Result<Vec<u8>, Error> {
        let filtered: Vec<u8> = self.0.iter()
            .filter(|ch| !ch.is_ascii_whitespace())
            .copied()
            .collect();
        base64::decode(&filtered).map_err(|_| Error::Malformed)
    }
}


//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    Xml(quick_xml::Error),
    Malformed,
}

impl From<quick_xml::Error> for Error {
    fn from(err: quick_xml::Error) -> Self {
        Error::Xml(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Xml(ref err) => err.fmt(f),
            Error::Malformed => f.write_str("malformed XML"),
        }
    }
}

impl std::error::Error for Error { }
