// The MIT License (MIT)

// Copyright (c) 2015 Rustcc developers

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! Coroutine spawn options

const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Configuration for a coroutine about to be spawned.
#[derive(Debug, Clone)]
pub struct Options {
    /// Size in bytes of the stack given to the coroutine.
    pub stack_size: usize,

    /// Debug label, surfaced in logs and panic messages.
    pub name: Option<String>,
}

impl Options {
    pub fn new() -> Options {
        Options::default()
    }

    #[inline]
    pub fn stack_size(&mut self, stack_size: usize) -> &mut Options {
        self.stack_size = stack_size;
        self
    }

    #[inline]
    pub fn name(&mut self, name: String) -> &mut Options {
        self.name = Some(name);
        self
    }
}

impl Default for Options {
    fn default() -> Options {
        Options {
            stack_size: DEFAULT_STACK_SIZE,
            name: None,
        }
    }
}
