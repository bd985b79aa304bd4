//! Demonstration of traced allocation: builds a 4x3 matrix of `i32` through traced
//! allocations, extends it by one column through traced reallocations, then releases every
//! row and the spine through traced frees, all under the frame chain
//! `add_column:make_extend_array:main`.

use args::Args;
use getopts::Occur;
use libc::c_void;
use mem_trace::{LibcAllocator, TraceContext, TracedAllocator};
use std::fs::File;
use std::io::{self, Write};
use std::mem;

const PROGRAM_DESC: &str = "Demonstrate traced allocation with a growable 2d array";
const PROGRAM_NAME: &str = "mt_demo";

const ROWS: usize = 4;
const COLS: usize = 3;

// Rows are accessed through the spine pointer, C-style.
type Matrix = *mut *mut i32;

fn main() -> Result<(), anyhow::Error> {
    let mut args = Args::new(PROGRAM_NAME, PROGRAM_DESC);
    args.option(
        "o",
        "output",
        "File that receives the trace log (stdout when omitted)",
        "FILE",
        Occur::Optional,
        None,
    );

    args.parse_from_cli()?;

    let sink: Box<dyn Write> = if args.has_value("output") {
        let path: String = args.value_of("output")?;
        Box::new(File::create(path)?)
    } else {
        Box::new(io::stdout())
    };

    let mut ctx = TraceContext::new();
    let mut alloc = TracedAllocator::new(LibcAllocator, sink);

    ctx.push("main");
    make_extend_array(&mut ctx, &mut alloc)?;
    ctx.pop();

    Ok(())
}

fn make_extend_array<W: Write>(
    ctx: &mut TraceContext<'_>,
    alloc: &mut TracedAllocator<LibcAllocator, W>,
) -> Result<(), anyhow::Error> {
    ctx.push("make_extend_array");

    let array = alloc.trace_allocate(ctx, ROWS * mem::size_of::<*mut i32>()) as Matrix;
    anyhow::ensure!(!array.is_null(), "matrix spine allocation failed");

    for i in 0..ROWS {
        let row = alloc.trace_allocate(ctx, COLS * mem::size_of::<i32>()) as *mut i32;
        anyhow::ensure!(!row.is_null(), "row allocation failed");
        unsafe {
            for j in 0..COLS {
                *row.add(j) = (10 * i + j) as i32;
            }
            *array.add(i) = row;
        }
    }
    print_matrix(array, COLS);

    let new_cols = add_column(ctx, alloc, array)?;
    print_matrix(array, new_cols);

    unsafe {
        for i in 0..ROWS {
            let row = *array.add(i);
            alloc.trace_free(ctx, row as *mut c_void);
        }
        alloc.trace_free(ctx, array as *mut c_void);
    }

    ctx.pop();
    Ok(())
}

// Grows every row by one column and returns the new column count.
fn add_column<W: Write>(
    ctx: &mut TraceContext<'_>,
    alloc: &mut TracedAllocator<LibcAllocator, W>,
    array: Matrix,
) -> Result<usize, anyhow::Error> {
    ctx.push("add_column");

    for i in 0..ROWS {
        unsafe {
            let old = *array.add(i) as *mut c_void;
            let size = (COLS + 1) * mem::size_of::<i32>();
            let row = alloc.trace_reallocate(ctx, old, size) as *mut i32;
            anyhow::ensure!(!row.is_null(), "row reallocation failed");
            *row.add(COLS) = (10 * i + COLS) as i32;
            *array.add(i) = row;
        }
    }

    ctx.pop();
    Ok(COLS + 1)
}

fn print_matrix(array: Matrix, cols: usize) {
    for i in 0..ROWS {
        for j in 0..cols {
            let value = unsafe { *(*array.add(i)).add(j) };
            println!("array[{}][{}]={}", i, j, value);
        }
    }
}
